pub mod backbone;
pub mod data;
pub mod evaluation;
pub mod export;
pub mod inference;
pub mod layout;
pub mod ml_model;
pub mod training;

pub use backbone::{timm_key_prefixes, Xception, XceptionConfig};
pub use data::{DataStreams, ImageBatch, ImageBatcher, ImageDataset, ImageItem};
pub use evaluation::{evaluate, ClassificationReport, ConfusionMatrix, Evaluation};
pub use export::{export_file_name, export_model, ExportedModel};
pub use inference::{InferenceEngine, Prediction};
pub use ml_model::{
    load_and_normalize_image, ClassifierHead, FaceShapeClassifier, ModelConfig, Preprocessing,
};
pub use training::{train, EarlyStopping, EpochMetrics, TrainingHistory, TrainingOutcome};
