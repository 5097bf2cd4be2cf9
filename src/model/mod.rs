pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{
    AugmentSettings, AugmentationSettings, BalanceSettings, DatasetSettings, DeviceType,
    ModelSettings, OutputSettings, PipelineConfig, TrainingSettings,
};
pub use model_metadata::{ModelMetadata, Precision};
pub use model_storage::{
    decode_classifier, encode_classifier, load_classifier, load_metadata, load_model_with_metadata,
    package_path, print_metadata_info, save_classifier, save_model_with_metadata,
};
