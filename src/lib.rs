//! 顔型分類パイプライン
//!
//! データセットのクラスバランス調整、固定したXceptionバックボーン上での転移学習、
//! テストデータでの評価、推論用パッケージのエクスポートを行います。

pub mod dataset;
pub mod error;
pub mod ml;
pub mod model;
pub mod pipeline;

pub use error::DatasetError;
pub use model::config::{DeviceType, PipelineConfig};
pub use pipeline::{
    run_all, run_balance, run_export, run_import_weights, run_inspect, run_training, PipelineSummary,
    TrainingSummary,
};
