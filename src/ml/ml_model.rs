//! 顔型分類モデルの定義
//!
//! 固定したXceptionバックボーンと学習対象の分類ヘッドから構成されます。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use image::{imageops::FilterType, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ml::backbone::{Xception, XceptionConfig};
use crate::model::config::ModelSettings;

/// バックボーンが期待する入力の正規化
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Preprocessing {
    /// [-1, 1] にスケーリング（Xception / Inception系）
    #[default]
    Xception,
    /// ImageNetの平均と標準偏差で正規化
    ImageNet,
}

impl Preprocessing {
    const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
    const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

    /// 1画素1チャネルの値を正規化
    pub fn normalize(&self, channel: usize, value: u8) -> f32 {
        match self {
            Preprocessing::Xception => value as f32 / 127.5 - 1.0,
            Preprocessing::ImageNet => {
                let v = value as f32 / 255.0;
                (v - Self::IMAGENET_MEAN[channel]) / Self::IMAGENET_STD[channel]
            }
        }
    }
}

/// 分類ヘッド設定
#[derive(Config, Debug)]
pub struct ClassifierHeadConfig {
    /// 入力特徴次元（バックボーンの出力チャネル数）
    pub num_features: usize,
    /// 分類クラス数
    pub num_classes: usize,
    #[config(default = 512)]
    pub hidden_1: usize,
    #[config(default = 128)]
    pub hidden_2: usize,
    #[config(default = 0.4)]
    pub dropout_1: f64,
    #[config(default = 0.3)]
    pub dropout_2: f64,
}

impl ClassifierHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        ClassifierHead {
            fc1: LinearConfig::new(self.num_features, self.hidden_1).init(device),
            dropout1: DropoutConfig::new(self.dropout_1).init(),
            fc2: LinearConfig::new(self.hidden_1, self.hidden_2).init(device),
            dropout2: DropoutConfig::new(self.dropout_2).init(),
            output: LinearConfig::new(self.hidden_2, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 分類ヘッド
///
/// # アーキテクチャ
/// - FC: features -> 512 + ReLU + Dropout(0.4)
/// - FC: 512 -> 128 + ReLU + Dropout(0.3)
/// - FC: 128 -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    fc1: Linear<B>,
    dropout1: Dropout,
    fc2: Linear<B>,
    dropout2: Dropout,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    /// 特徴ベクトル [batch_size, num_features] → ロジット [batch_size, num_classes]
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.fc1.forward(features));
        let x = self.dropout1.forward(x);
        let x = self.activation.forward(self.fc2.forward(x));
        let x = self.dropout2.forward(x);
        self.output.forward(x)
    }
}

/// モデル全体の設定（保存モデルのメタデータにも含まれる）
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// バックボーン設定
    pub backbone: XceptionConfig,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 512)]
    pub hidden_1: usize,
    #[config(default = 128)]
    pub hidden_2: usize,
    #[config(default = 0.4)]
    pub dropout_1: f64,
    #[config(default = 0.3)]
    pub dropout_2: f64,
}

impl ModelConfig {
    /// パイプライン設定から作成
    pub fn from_settings(settings: &ModelSettings, num_classes: usize) -> Self {
        let backbone = XceptionConfig::new()
            .with_width_multiplier(settings.width_multiplier)
            .with_middle_blocks(settings.middle_blocks);
        Self::new(num_classes, backbone)
            .with_image_size(settings.image_size)
            .with_hidden_1(settings.hidden_units_1)
            .with_hidden_2(settings.hidden_units_2)
            .with_dropout_1(settings.dropout_1)
            .with_dropout_2(settings.dropout_2)
    }

    pub fn head_config(&self) -> ClassifierHeadConfig {
        ClassifierHeadConfig::new(self.backbone.feature_dim(), self.num_classes)
            .with_hidden_1(self.hidden_1)
            .with_hidden_2(self.hidden_2)
            .with_dropout_1(self.dropout_1)
            .with_dropout_2(self.dropout_2)
    }

    /// モデルを初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> FaceShapeClassifier<B> {
        tracing::debug!(
            "[Model] 入力 {}x{}, 特徴次元 {}, FC {} -> {} -> {}",
            self.image_size,
            self.image_size,
            self.backbone.feature_dim(),
            self.hidden_1,
            self.hidden_2,
            self.num_classes
        );
        FaceShapeClassifier {
            backbone: self.backbone.init(device),
            head: self.head_config().init(device),
        }
    }

    /// 事前学習済みバックボーンを読み込んでモデルを初期化
    ///
    /// `weights` が None の場合はランダム初期化のまま警告を出します。
    pub fn init_pretrained<B: Backend>(
        &self,
        weights: Option<&Path>,
        device: &B::Device,
    ) -> Result<FaceShapeClassifier<B>> {
        let model = self.init::<B>(device);
        let backbone = match weights {
            Some(path) => {
                let backbone = model.backbone.load_pretrained(path, device)?;
                tracing::info!("事前学習済みバックボーンを読み込みました: {}", path.display());
                backbone
            }
            None => {
                tracing::warn!("バックボーン重みが未設定です。ランダム初期化のまま固定して学習します");
                model.backbone
            }
        };
        Ok(FaceShapeClassifier {
            backbone,
            head: model.head,
        })
    }
}

/// 顔型分類モデル
#[derive(Module, Debug)]
pub struct FaceShapeClassifier<B: Backend> {
    backbone: Xception<B>,
    head: ClassifierHead<B>,
}

impl<B: Backend> FaceShapeClassifier<B> {
    pub fn from_parts(backbone: Xception<B>, head: ClassifierHead<B>) -> Self {
        Self { backbone, head }
    }

    pub fn into_parts(self) -> (Xception<B>, ClassifierHead<B>) {
        (self.backbone, self.head)
    }

    /// レコードのブロック構成がこのモデルと一致するか確認する
    pub fn ensure_record_layout(&self, record: &FaceShapeClassifierRecord<B>) -> Result<()> {
        self.backbone.ensure_record_layout(&record.backbone)
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.features(images))
    }

    /// クラスごとの確率分布 [batch_size, num_classes]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}

/// RGB画像を (C, H, W) 順の正規化済みベクトルに変換
pub fn image_to_chw(img: &RgbImage, preprocessing: Preprocessing) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);
    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                data.push(preprocessing.normalize(channel, pixel[channel]));
            }
        }
    }
    data
}

/// 画像を読み込み、指定サイズの正方形にリサイズする
pub fn load_resized_image(path: &Path, image_size: usize) -> Result<RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?
        .to_rgb8();
    let size = image_size as u32;
    if img.dimensions() == (size, size) {
        return Ok(img);
    }
    Ok(image::imageops::resize(&img, size, size, FilterType::Triangle))
}

/// 画像を読み込んでリサイズ・正規化
pub fn load_and_normalize_image(
    path: &Path,
    image_size: usize,
    preprocessing: Preprocessing,
) -> Result<Vec<f32>> {
    let img = load_resized_image(path, image_size)?;
    Ok(image_to_chw(&img, preprocessing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::Rgb;

    type TestBackend = NdArray;

    fn tiny_config(num_classes: usize) -> ModelConfig {
        ModelConfig::new(
            num_classes,
            XceptionConfig::new()
                .with_width_multiplier(0.0625)
                .with_middle_blocks(0),
        )
        .with_image_size(32)
        .with_hidden_1(16)
        .with_hidden_2(8)
    }

    #[test]
    fn test_preprocessing_ranges() {
        assert_eq!(Preprocessing::Xception.normalize(0, 0), -1.0);
        assert_eq!(Preprocessing::Xception.normalize(1, 255), 1.0);
        let v = Preprocessing::ImageNet.normalize(0, 0);
        assert!((v - (-0.485 / 0.229)).abs() < 1e-5);
    }

    #[test]
    fn test_image_to_chw_layout() {
        let img = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 255, 0]) });
        let data = image_to_chw(&img, Preprocessing::Xception);
        assert_eq!(data, vec![1.0, -1.0, -1.0, 1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_predict_proba_is_distribution() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config(5).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 32, 32], &device);

        let probs = model.predict_proba(images);
        assert_eq!(probs.dims(), [3, 5]);
        let values: Vec<f32> = probs.into_data().to_vec().unwrap();
        for row in values.chunks(5) {
            assert!(row.iter().all(|p| *p >= 0.0));
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_from_settings() {
        let settings = ModelSettings::default();
        let config = ModelConfig::from_settings(&settings, 5);
        assert_eq!(config.image_size, 224);
        assert_eq!(config.backbone.middle_blocks, 8);
        assert_eq!(config.head_config().num_features, 2048);
        assert_eq!(config.head_config().hidden_1, 512);
    }

    #[test]
    fn test_load_resized_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        RgbImage::from_pixel(40, 30, Rgb([10, 20, 30])).save(&path).unwrap();
        let img = load_resized_image(&path, 16).unwrap();
        assert_eq!(img.dimensions(), (16, 16));
        assert_eq!(load_and_normalize_image(&path, 16, Preprocessing::Xception).unwrap().len(), 3 * 16 * 16);
    }
}
