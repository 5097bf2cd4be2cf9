//! 画像ファイルの列挙・集計・重複チェック

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// 対象とする画像拡張子（大文字小文字は区別しない）
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 画像ファイルかどうかを拡張子で判定
pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// ディレクトリ直下の画像ファイルをファイル名順で返す
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// ディレクトリ直下の画像枚数
pub fn count_images(dir: &Path) -> Result<usize> {
    Ok(list_images(dir)?.len())
}

/// ルート直下の各クラスディレクトリの画像枚数（クラス名順）
pub fn count_images_per_class(root: &Path) -> Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("Failed to read directory: {}", root.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        counts.insert(name.to_string(), count_images(&path)?);
    }
    Ok(counts)
}

/// ルート配下（クラスディレクトリ直下）の画像ファイル名の集合
fn collect_file_names(root: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("Failed to read directory: {}", root.display()))?
    {
        let class_path = entry?.path();
        if !class_path.is_dir() {
            continue;
        }
        for image in list_images(&class_path)? {
            if let Some(name) = image.file_name().and_then(|n| n.to_str()) {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}

/// 学習ルートとテストルートの両方に存在するファイル名を返す
pub fn find_common_images(train_root: &Path, test_root: &Path) -> Result<BTreeSet<String>> {
    let train = collect_file_names(train_root)?;
    let test = collect_file_names(test_root)?;
    Ok(train.intersection(&test).cloned().collect())
}

/// クラスごとの枚数を表示
pub fn print_class_counts(counts: &BTreeMap<String, usize>) {
    println!("\n学習用 顔型別画像数:");
    for (class_name, count) in counts {
        println!("  {}: {}枚", class_name, count);
    }
}

/// 重複ファイルの件数と例（最大10件）を表示
pub fn print_common_images(common: &BTreeSet<String>) {
    println!("\n重複した画像ファイル数: {}件", common.len());
    if common.is_empty() {
        println!("学習/テストデータセット間のファイル名重複なし");
        return;
    }
    println!("重複ファイル例（最大10件）:");
    for name in common.iter().take(10) {
        println!("  - {}", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_list_images_filters_extensions() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "b.PNG");
        touch(dir.path(), "a.jpg");
        touch(dir.path(), "c.jpeg");
        touch(dir.path(), "notes.txt");
        fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let images = list_images(dir.path()).unwrap();
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.jpeg"]);
    }

    #[test]
    fn test_count_images_per_class() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("Oval"), "1.jpg");
        touch(&dir.path().join("Oval"), "2.jpg");
        touch(&dir.path().join("Heart"), "1.png");
        fs::create_dir(dir.path().join("Round")).unwrap();

        let counts = count_images_per_class(dir.path()).unwrap();
        let expected: Vec<(&str, usize)> = vec![("Heart", 1), ("Oval", 2), ("Round", 0)];
        let actual: Vec<(&str, usize)> = counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_no_common_images() {
        let train = tempdir().unwrap();
        let test = tempdir().unwrap();
        for i in 0..5 {
            touch(&train.path().join("Heart"), &format!("train_{i}.jpg"));
            touch(&test.path().join("Heart"), &format!("test_{i}.jpg"));
        }
        assert!(find_common_images(train.path(), test.path()).unwrap().is_empty());
    }

    #[test]
    fn test_known_overlap() {
        let train = tempdir().unwrap();
        let test = tempdir().unwrap();
        // 学習6枚 + テスト4枚のうち2件が同名（別クラスに置かれていても検出する）
        for name in ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "dup1.jpg", "dup2.jpg"] {
            touch(&train.path().join("Oval"), name);
        }
        touch(&test.path().join("Oval"), "dup1.jpg");
        touch(&test.path().join("Round"), "dup2.jpg");
        touch(&test.path().join("Round"), "e.jpg");
        touch(&test.path().join("Round"), "f.jpg");

        let common = find_common_images(train.path(), test.path()).unwrap();
        let common: Vec<_> = common.into_iter().collect();
        assert_eq!(common, vec!["dup1.jpg".to_string(), "dup2.jpg".to_string()]);
    }
}
