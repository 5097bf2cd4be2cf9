//! モデル推論機能

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};
use std::path::Path;

use crate::ml::export::verify_distribution;
use crate::ml::ml_model::{load_and_normalize_image, FaceShapeClassifier};
use crate::model::{load_classifier, ModelMetadata};

/// 1枚分の分類結果
#[derive(Debug, Clone)]
pub struct Prediction {
    pub class_index: usize,
    pub class_name: String,
    /// クラスごとの確率（メタデータのクラス順）
    pub probabilities: Vec<f32>,
}

impl Prediction {
    pub fn confidence(&self) -> f32 {
        self.probabilities[self.class_index]
    }
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: FaceShapeClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルパッケージを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model) = load_classifier::<B>(model_path.as_ref(), &device)?;
        Ok(Self {
            model,
            metadata,
            device,
        })
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let mut predictions = self.classify_batch(&[image_path])?;
        predictions
            .pop()
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))
    }

    /// 複数画像をまとめて分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        if image_paths.is_empty() {
            return Ok(Vec::new());
        }
        let size = self.metadata.image_size();

        let mut pixels = Vec::with_capacity(image_paths.len() * 3 * size * size);
        for path in image_paths {
            pixels.extend(load_and_normalize_image(
                path.as_ref(),
                size,
                self.metadata.preprocessing,
            )?);
        }

        let tensor = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([image_paths.len(), 3, size, size]);
        let probs: Vec<f32> = self
            .model
            .predict_proba(tensor)
            .into_data()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        probs
            .chunks(self.metadata.num_classes())
            .map(|row| self.to_prediction(row.to_vec()))
            .collect()
    }

    fn to_prediction(&self, probabilities: Vec<f32>) -> Result<Prediction> {
        let class_index = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))?;
        let class_name = self
            .metadata
            .class_names
            .name(class_index)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_index))?
            .to_string();
        Ok(Prediction {
            class_index,
            class_name,
            probabilities,
        })
    }

    /// ゼロ画像で推論して出力を確認
    pub fn predict_blank(&self) -> Result<Vec<f32>> {
        verify_distribution(&self.model, &self.metadata, &self.device)
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}
