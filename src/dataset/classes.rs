//! クラス一覧（インデックス→クラス名の対応表）
//!
//! 学習ルートのサブディレクトリ名をソートして一度だけ決定し、
//! 学習・検証・テストの各ストリームと評価、保存モデルに同じ値を渡します。

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::DatasetError;

/// ソート済みクラス名の一覧。位置がそのままクラスインデックスになる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassIndex {
    names: Vec<String>,
}

impl ClassIndex {
    /// ルート直下のディレクトリ名からクラス一覧を作る
    pub fn discover(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(DatasetError::MissingRoot(root.to_path_buf()).into());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }

        if names.is_empty() {
            return Err(DatasetError::NoClasses(root.to_path_buf()).into());
        }

        Ok(Self::from_names(names))
    }

    /// クラス一覧を作り、期待するクラス数と一致するか検証する
    pub fn discover_expecting(root: &Path, expected: Option<usize>) -> Result<Self> {
        let classes = Self::discover(root)?;
        if let Some(expected) = expected {
            if classes.len() != expected {
                return Err(DatasetError::ClassCountMismatch {
                    root: root.to_path_buf(),
                    expected,
                    found: classes.len(),
                    names: classes.names.clone(),
                }
                .into());
            }
        }
        Ok(classes)
    }

    /// 名前の一覧から作る（ソートして重複を除く）
    pub fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_discover_sorted() {
        let dir = tempdir().unwrap();
        for name in ["Square", "Heart", "Round", "Oval", "Oblong"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("README.txt"), b"not a class").unwrap();

        let classes = ClassIndex::discover(dir.path()).unwrap();
        assert_eq!(classes.names(), &["Heart", "Oblong", "Oval", "Round", "Square"]);
        assert_eq!(classes.index_of("Oval"), Some(2));
        assert_eq!(classes.name(4), Some("Square"));
        assert_eq!(classes.name(5), None);
    }

    #[test]
    fn test_discover_count_mismatch() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("Heart")).unwrap();
        fs::create_dir(dir.path().join("Oval")).unwrap();

        let err = ClassIndex::discover_expecting(dir.path(), Some(5)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::ClassCountMismatch { found: 2, .. })
        ));
    }

    #[test]
    fn test_discover_missing_root() {
        let dir = tempdir().unwrap();
        let err = ClassIndex::discover(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::MissingRoot(_))
        ));
    }

    #[test]
    fn test_serde_is_plain_list() {
        let classes = ClassIndex::from_names(["Round", "Heart"]);
        let json = serde_json::to_string(&classes).unwrap();
        assert_eq!(json, r#"["Heart","Round"]"#);
        let back: ClassIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, classes);
    }
}
