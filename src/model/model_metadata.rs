//! モデルメタデータの定義と永続化
//!
//! モデルパッケージ（tar.gz）に同梱され、推論時にクラス順序と入力形式を復元するために使います。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dataset::classes::ClassIndex;
use crate::ml::ml_model::{ModelConfig, Preprocessing};

/// 重みの保存精度
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// f32
    #[default]
    Full,
    /// f16（読み込み後の計算はf32）
    Half,
}

impl Precision {
    /// エクスポートファイル名に使う接尾辞
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Precision::Full => "float32",
            Precision::Half => "f16",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_suffix())
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（インデックス順）
    /// 例: ["Heart", "Oblong", "Oval", "Round", "Square"]
    pub class_names: ClassIndex,

    /// モデル構造（バックボーン幅、入力サイズ、ヘッド構成）
    pub model_config: ModelConfig,

    /// 入力の正規化方式
    pub preprocessing: Preprocessing,

    /// model.bin の精度
    #[serde(default)]
    pub precision: Precision,

    /// 学習したエポック数
    pub num_epochs: u32,

    /// 検証データでの最高正解率
    #[serde(default)]
    pub best_val_accuracy: Option<f64>,

    /// テストデータでの正解率（評価後のパッケージのみ）
    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成（時刻は現在時刻）
    pub fn new(
        class_names: ClassIndex,
        model_config: ModelConfig,
        preprocessing: Preprocessing,
        num_epochs: u32,
    ) -> Self {
        Self {
            class_names,
            model_config,
            preprocessing,
            precision: Precision::Full,
            num_epochs,
            best_val_accuracy: None,
            test_accuracy: None,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_best_val_accuracy(mut self, accuracy: f64) -> Self {
        self.best_val_accuracy = Some(accuracy);
        self
    }

    pub fn with_test_accuracy(mut self, accuracy: f64) -> Self {
        self.test_accuracy = Some(accuracy);
        self
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn image_size(&self) -> usize {
        self.model_config.image_size
    }

    /// クラス名の数とモデルの出力数が一致するか検証
    pub fn validate(&self) -> Result<()> {
        if self.class_names.len() != self.model_config.num_classes {
            anyhow::bail!(
                "metadata lists {} classes but the model has {} outputs",
                self.class_names.len(),
                self.model_config.num_classes
            );
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        metadata.validate()?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::XceptionConfig;

    fn sample() -> ModelMetadata {
        ModelMetadata::new(
            ClassIndex::from_names(["Square", "Heart", "Oval", "Round", "Oblong"]),
            ModelConfig::new(5, XceptionConfig::new()),
            Preprocessing::Xception,
            12,
        )
    }

    #[test]
    fn test_json_keeps_class_order() {
        let json = sample().with_best_val_accuracy(0.8).to_json_string().unwrap();
        assert!(json.contains("\"precision\": \"full\""));

        let restored = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(
            restored.class_names.names(),
            ["Heart", "Oblong", "Oval", "Round", "Square"]
        );
        assert_eq!(restored.image_size(), 224);
        assert_eq!(restored.best_val_accuracy, Some(0.8));
        assert_eq!(restored.test_accuracy, None);
    }

    #[test]
    fn test_class_count_mismatch_is_rejected() {
        let mut metadata = sample();
        metadata.model_config.num_classes = 4;
        let json = metadata.to_json_string().unwrap();
        assert!(ModelMetadata::from_json_string(&json).is_err());
    }

    #[test]
    fn test_precision_suffix() {
        assert_eq!(Precision::Full.file_suffix(), "float32");
        assert_eq!(Precision::Half.to_string(), "f16");
    }
}
