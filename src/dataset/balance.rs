//! クラスバランス調整
//!
//! - 目標枚数を超えるクラス: 超過分を一様ランダムに選んで削除
//! - 目標枚数に満たないクラス: 既存画像にランダム変換をかけた `aug_` ファイルを生成
//!
//! `balance_dataset` は元データを作業ディレクトリへコピーしてから調整するため、
//! 元のデータセットは変更されず、同じシードなら何度実行しても同じ結果になります。

use anyhow::{Context, Result};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

use crate::dataset::augment::RandomAffine;
use crate::dataset::classes::ClassIndex;
use crate::dataset::scan::{count_images, list_images};
use crate::model::config::{AugmentSettings, BalanceSettings};

/// 1クラス分の調整結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceOutcome {
    /// ディレクトリが存在しないためスキップ
    Skipped,
    /// 変更不要
    Unchanged { count: usize },
    /// 超過分を削除
    Reduced { before: usize, after: usize },
    /// 不足分を生成
    Augmented {
        before: usize,
        after: usize,
        generated: usize,
    },
}

impl BalanceOutcome {
    /// 調整後の枚数（スキップ時はNone）
    pub fn final_count(&self) -> Option<usize> {
        match *self {
            BalanceOutcome::Skipped => None,
            BalanceOutcome::Unchanged { count } => Some(count),
            BalanceOutcome::Reduced { after, .. } => Some(after),
            BalanceOutcome::Augmented { after, .. } => Some(after),
        }
    }
}

/// データセット全体の調整結果
#[derive(Debug, Clone)]
pub struct BalanceReport {
    /// 調整後のデータが置かれたルート
    pub root: PathBuf,
    pub classes: Vec<(String, BalanceOutcome)>,
}

impl BalanceReport {
    pub fn print_summary(&self) {
        println!("\n=== クラスバランス調整結果 ({}) ===", self.root.display());
        for (class_name, outcome) in &self.classes {
            match outcome {
                BalanceOutcome::Skipped => println!("  {}: スキップ（ディレクトリなし）", class_name),
                BalanceOutcome::Unchanged { count } => {
                    println!("  {}: {}枚（変更なし）", class_name, count)
                }
                BalanceOutcome::Reduced { before, after } => {
                    println!("  {}: {} → {}枚（削除 {}枚）", class_name, before, after, before - after)
                }
                BalanceOutcome::Augmented {
                    before,
                    after,
                    generated,
                } => println!("  {}: {} → {}枚（生成 {}枚）", class_name, before, after, generated),
            }
        }
    }
}

/// 目標枚数を超える画像を一様ランダムに削除する（元に戻せない）
pub fn reduce_class<R: Rng>(dir: &Path, target: usize, rng: &mut R) -> Result<BalanceOutcome> {
    if !dir.is_dir() {
        tracing::warn!("ディレクトリがありません: {}", dir.display());
        return Ok(BalanceOutcome::Skipped);
    }

    let all_images = list_images(dir)?;
    let before = all_images.len();
    if before <= target {
        tracing::info!("{}: {}枚（削除不要）", class_label(dir), before);
        return Ok(BalanceOutcome::Unchanged { count: before });
    }

    let excess = before - target;
    tracing::info!(
        "{}: {}枚 → {}枚に調整（削除 {}枚）",
        class_label(dir),
        before,
        target,
        excess
    );

    for path in all_images.choose_multiple(rng, excess) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("削除失敗: {} ({})", path.display(), e);
        }
    }

    let after = count_images(dir)?;
    Ok(BalanceOutcome::Reduced { before, after })
}

/// 目標枚数に満たない場合、既存画像を変換した `aug_` 画像を同じディレクトリに生成する
///
/// 元画像をファイル名順に巡回し、残りの不足数を残りの元画像数で割った枚数ずつ生成します。
/// 読み込めない画像は警告を出して以降の巡回から外し、その分は他の画像が引き受けます。
pub fn augment_class<R: Rng>(
    dir: &Path,
    target: usize,
    augmenter: &RandomAffine,
    rng: &mut R,
) -> Result<BalanceOutcome> {
    if !dir.is_dir() {
        tracing::warn!("ディレクトリがありません: {}", dir.display());
        return Ok(BalanceOutcome::Skipped);
    }

    let sources = list_images(dir)?;
    let before = sources.len();
    if before >= target {
        tracing::info!("{}: {}枚（生成不要）", class_label(dir), before);
        return Ok(BalanceOutcome::Unchanged { count: before });
    }

    let needed = target - before;
    tracing::info!(
        "{}: {} → {}（{}枚生成）",
        class_label(dir),
        before,
        target,
        needed
    );

    let mut generated = 0usize;
    let mut serial = 0usize;
    let mut unreadable = vec![false; sources.len()];

    // 読める元画像が残っている限り、不足がなくなるまで巡回する
    while generated < needed && unreadable.iter().any(|u| !u) {
        for (i, source) in sources.iter().enumerate() {
            if generated >= needed {
                break;
            }
            if unreadable[i] {
                continue;
            }

            let img = match image::open(source) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!("画像の読み込みに失敗: {} ({})", source.display(), e);
                    unreadable[i] = true;
                    continue;
                }
            };

            let remaining_sources = sources.len() - i;
            let quota = (needed - generated).div_ceil(remaining_sources);
            let stem = source
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "img".to_string());

            for _ in 0..quota {
                let augmented = augmenter.apply(&img, rng);
                let out_path = next_free_path(dir, &stem, &mut serial);
                DynamicImage::ImageRgb8(augmented)
                    .save(&out_path)
                    .with_context(|| format!("Failed to write augmented image: {}", out_path.display()))?;
                generated += 1;
            }
        }
    }

    if generated < needed {
        tracing::warn!(
            "{}: 読み込める元画像が足りず {}枚のみ生成しました（不足 {}枚）",
            class_label(dir),
            generated,
            needed - generated
        );
    }

    let after = count_images(dir)?;
    Ok(BalanceOutcome::Augmented {
        before,
        after,
        generated,
    })
}

/// 枚数に応じて削除または生成を行う
pub fn balance_class<R: Rng>(
    dir: &Path,
    target: usize,
    augmenter: &RandomAffine,
    rng: &mut R,
) -> Result<BalanceOutcome> {
    if !dir.is_dir() {
        tracing::warn!("ディレクトリがありません: {}", dir.display());
        return Ok(BalanceOutcome::Skipped);
    }
    let count = count_images(dir)?;
    if count > target {
        reduce_class(dir, target, rng)
    } else {
        augment_class(dir, target, augmenter, rng)
    }
}

/// 元データを作業ディレクトリにコピーしてからバランス調整する
///
/// 作業ディレクトリが既に存在する場合は削除して作り直します。
pub fn balance_dataset(
    source_root: &Path,
    work_root: &Path,
    classes: &ClassIndex,
    settings: &BalanceSettings,
    augment: &AugmentSettings,
    seed: u64,
) -> Result<BalanceReport> {
    if work_root.exists() {
        std::fs::remove_dir_all(work_root)
            .with_context(|| format!("Failed to clear work directory: {}", work_root.display()))?;
    }
    std::fs::create_dir_all(work_root)
        .with_context(|| format!("Failed to create work directory: {}", work_root.display()))?;

    let augmenter = RandomAffine::new(augment.clone())?;
    let mut report = BalanceReport {
        root: work_root.to_path_buf(),
        classes: Vec::with_capacity(classes.len()),
    };

    for (class_id, class_name) in classes.iter() {
        let source_dir = source_root.join(class_name);
        if !source_dir.is_dir() {
            tracing::warn!("ディレクトリがありません: {}", source_dir.display());
            report.classes.push((class_name.to_string(), BalanceOutcome::Skipped));
            continue;
        }

        let dest_dir = work_root.join(class_name);
        std::fs::create_dir_all(&dest_dir)?;
        for image_path in list_images(&source_dir)? {
            if let Some(file_name) = image_path.file_name() {
                std::fs::copy(&image_path, dest_dir.join(file_name)).with_context(|| {
                    format!("Failed to copy {} into work directory", image_path.display())
                })?;
            }
        }

        let mut rng = class_rng(seed, class_id);
        let outcome = balance_class(&dest_dir, settings.target_per_class, &augmenter, &mut rng)?;
        report.classes.push((class_name.to_string(), outcome));
    }

    Ok(report)
}

/// 学習ルートを直接書き換えてバランス調整する（破壊的）
pub fn balance_in_place(
    root: &Path,
    classes: &ClassIndex,
    target: usize,
    augment: &AugmentSettings,
    seed: u64,
) -> Result<BalanceReport> {
    let augmenter = RandomAffine::new(augment.clone())?;
    let mut report = BalanceReport {
        root: root.to_path_buf(),
        classes: Vec::with_capacity(classes.len()),
    };
    for (class_id, class_name) in classes.iter() {
        let mut rng = class_rng(seed, class_id);
        let outcome = balance_class(&root.join(class_name), target, &augmenter, &mut rng)?;
        report.classes.push((class_name.to_string(), outcome));
    }
    Ok(report)
}

/// クラスごとに独立した乱数列（処理順に依存しない）
fn class_rng(seed: u64, class_id: usize) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(class_id as u64))
}

fn class_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string())
}

fn next_free_path(dir: &Path, stem: &str, serial: &mut usize) -> PathBuf {
    loop {
        let candidate = dir.join(format!("aug_{}_{}.jpg", stem, *serial));
        *serial += 1;
        if !candidate.exists() {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::fs;
    use tempfile::tempdir;

    fn write_images(dir: &Path, count: usize) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            let img = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, i as u8]));
            img.save(dir.join(format!("img_{i:03}.png"))).unwrap();
        }
    }

    fn augmenter() -> RandomAffine {
        RandomAffine::new(AugmentSettings::balancing()).unwrap()
    }

    #[test]
    fn test_reduce_to_target() {
        let dir = tempdir().unwrap();
        let class_dir = dir.path().join("Square");
        write_images(&class_dir, 12);

        let mut rng = StdRng::seed_from_u64(1);
        let outcome = reduce_class(&class_dir, 5, &mut rng).unwrap();
        assert_eq!(outcome, BalanceOutcome::Reduced { before: 12, after: 5 });
        assert_eq!(count_images(&class_dir).unwrap(), 5);
    }

    #[test]
    fn test_reduce_missing_dir_is_skipped() {
        let dir = tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = reduce_class(&dir.path().join("missing"), 5, &mut rng).unwrap();
        assert_eq!(outcome, BalanceOutcome::Skipped);
    }

    #[test]
    fn test_augment_to_target() {
        let dir = tempdir().unwrap();
        let class_dir = dir.path().join("Heart");
        write_images(&class_dir, 3);

        let mut rng = StdRng::seed_from_u64(2);
        let outcome = augment_class(&class_dir, 10, &augmenter(), &mut rng).unwrap();
        assert_eq!(
            outcome,
            BalanceOutcome::Augmented {
                before: 3,
                after: 10,
                generated: 7
            }
        );
        let augmented = list_images(&class_dir)
            .unwrap()
            .into_iter()
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("aug_"))
            .count();
        assert_eq!(augmented, 7);
    }

    #[test]
    fn test_augment_skips_corrupt_images() {
        let dir = tempdir().unwrap();
        let class_dir = dir.path().join("Oval");
        write_images(&class_dir, 2);
        fs::write(class_dir.join("broken.jpg"), b"not an image").unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        let outcome = augment_class(&class_dir, 9, &augmenter(), &mut rng).unwrap();
        assert_eq!(outcome.final_count(), Some(9));
    }

    #[test]
    fn test_augment_recovers_from_trailing_corrupt_image() {
        let dir = tempdir().unwrap();
        let class_dir = dir.path().join("Round");
        write_images(&class_dir, 1);
        fs::write(class_dir.join("zz_broken.jpg"), b"not an image").unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        let outcome = augment_class(&class_dir, 6, &augmenter(), &mut rng).unwrap();
        assert_eq!(outcome.final_count(), Some(6));
    }

    #[test]
    fn test_augment_without_readable_sources_keeps_count() {
        let dir = tempdir().unwrap();
        let class_dir = dir.path().join("Round");
        fs::create_dir_all(&class_dir).unwrap();
        fs::write(class_dir.join("a.jpg"), b"garbage").unwrap();
        fs::write(class_dir.join("b.jpg"), b"garbage").unwrap();

        let mut rng = StdRng::seed_from_u64(4);
        let outcome = augment_class(&class_dir, 6, &augmenter(), &mut rng).unwrap();
        assert_eq!(
            outcome,
            BalanceOutcome::Augmented {
                before: 2,
                after: 2,
                generated: 0
            }
        );
    }

    #[test]
    fn test_balance_dataset_leaves_source_untouched() {
        let source = tempdir().unwrap();
        let work = tempdir().unwrap();
        let work_root = work.path().join("balanced");
        write_images(&source.path().join("Heart"), 3);
        write_images(&source.path().join("Square"), 9);

        let classes = ClassIndex::discover(source.path()).unwrap();
        let settings = BalanceSettings {
            target_per_class: 6,
            ..BalanceSettings::default()
        };
        let report = balance_dataset(
            source.path(),
            &work_root,
            &classes,
            &settings,
            &AugmentSettings::balancing(),
            42,
        )
        .unwrap();

        for (_, outcome) in &report.classes {
            assert_eq!(outcome.final_count(), Some(6));
        }
        assert_eq!(count_images(&source.path().join("Heart")).unwrap(), 3);
        assert_eq!(count_images(&source.path().join("Square")).unwrap(), 9);

        // 再実行しても同じ結果になる
        let first: Vec<_> = list_images(&work_root.join("Square")).unwrap();
        balance_dataset(
            source.path(),
            &work_root,
            &classes,
            &settings,
            &AugmentSettings::balancing(),
            42,
        )
        .unwrap();
        let second: Vec<_> = list_images(&work_root.join("Square")).unwrap();
        assert_eq!(first, second);
        assert_eq!(count_images(&work_root.join("Heart")).unwrap(), 6);
    }
}
