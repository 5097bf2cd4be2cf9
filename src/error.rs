//! データセット構造に関するエラー定義

use std::path::PathBuf;
use thiserror::Error;

/// データセットのディレクトリ構造が前提を満たさない場合のエラー
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("dataset root not found: {0}")]
    MissingRoot(PathBuf),

    #[error("no class directories found under {0}")]
    NoClasses(PathBuf),

    #[error("expected {expected} classes under {root}, found {found}: {names:?}")]
    ClassCountMismatch {
        root: PathBuf,
        expected: usize,
        found: usize,
        names: Vec<String>,
    },

    #[error("class '{class}' has no images under {root}")]
    EmptyClass { root: PathBuf, class: String },

    #[error("no samples found under {0}")]
    NoSamples(PathBuf),
}
