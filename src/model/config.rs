//! パイプライン設定管理モジュール
//!
//! データセットのパス、バランス調整、モデル構成、学習パラメータ、出力先を
//! JSON形式で保存・読み込みします。各ステージはこの設定を引数として受け取ります。

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::Preprocessing;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// 学習用ルート（クラスごとのサブディレクトリを持つ）
    pub train_dir: PathBuf,
    /// テスト用ルート
    pub test_dir: PathBuf,
    /// 期待するクラス数（Noneなら検証しない）
    pub expected_num_classes: Option<usize>,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("FaceShape Dataset/training_set"),
            test_dir: PathBuf::from("FaceShape Dataset/testing_set"),
            expected_num_classes: Some(5),
        }
    }
}

/// クラスバランス調整の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceSettings {
    /// バランス調整を実行するか
    pub enabled: bool,
    /// クラスごとの目標枚数
    pub target_per_class: usize,
    /// trueなら学習ルートを直接書き換える（元スクリプト互換の破壊的モード）
    pub in_place: bool,
    /// バランス調整後のデータを置く作業ディレクトリ
    pub work_dir: PathBuf,
}

impl Default for BalanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_per_class: 3000,
            in_place: false,
            work_dir: PathBuf::from("work/balanced_train"),
        }
    }
}

/// ランダム幾何変換のパラメータ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AugmentSettings {
    /// 回転角の範囲（度、±）
    pub rotation_range: f32,
    /// 水平シフト（画像幅に対する割合、±）
    pub width_shift_range: f32,
    /// 垂直シフト（画像高さに対する割合、±）
    pub height_shift_range: f32,
    /// ズーム範囲（1±zoom）
    pub zoom_range: f32,
    /// 左右反転を行うか
    pub horizontal_flip: bool,
}

impl AugmentSettings {
    /// バランス調整でファイルを生成する際の変換
    pub fn balancing() -> Self {
        Self {
            rotation_range: 20.0,
            width_shift_range: 0.1,
            height_shift_range: 0.1,
            zoom_range: 0.1,
            horizontal_flip: true,
        }
    }

    /// 学習ストリームで毎回適用する変換
    pub fn training() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.1,
            height_shift_range: 0.1,
            zoom_range: 0.15,
            horizontal_flip: true,
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationSettings {
    pub balancing: AugmentSettings,
    pub training: AugmentSettings,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            balancing: AugmentSettings::balancing(),
            training: AugmentSettings::training(),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// バックボーンが期待する前処理
    pub preprocessing: Preprocessing,
    /// 事前学習済みバックボーン重みのパス（`.mpk`、またはtimmの `.pth` / `.safetensors`）
    pub backbone_weights: Option<PathBuf>,
    /// チャネル幅の倍率
    pub width_multiplier: f64,
    /// middle flowのブロック数
    pub middle_blocks: usize,
    /// 全結合層1のユニット数
    pub hidden_units_1: usize,
    /// 全結合層2のユニット数
    pub hidden_units_2: usize,
    /// 全結合層1の後のドロップアウト率
    pub dropout_1: f64,
    /// 全結合層2の後のドロップアウト率
    pub dropout_2: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            image_size: 224,
            preprocessing: Preprocessing::Xception,
            backbone_weights: Some(PathBuf::from("weights/xception-43020ad28.pth")),
            width_multiplier: 1.0,
            middle_blocks: 8,
            hidden_units_1: 512,
            hidden_units_2: 128,
            dropout_1: 0.4,
            dropout_2: 0.3,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数の上限
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 検証データの割合
    pub validation_split: f32,
    /// val_lossが改善しない許容エポック数
    pub patience: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 32,
            learning_rate: 1e-4,
            seed: 42,
            validation_split: 0.4,
            patience: 6,
        }
    }
}

/// 出力先設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// val_accuracy最良時のチェックポイント
    pub checkpoint_path: PathBuf,
    /// 評価後に保存する最終モデル
    pub final_model_path: PathBuf,
    /// エクスポート先ディレクトリ
    pub export_dir: PathBuf,
    /// レポート・CSVの出力先
    pub logs_dir: PathBuf,
    /// 画像の出力先
    pub plots_dir: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("xception_faceshape_best.tar.gz"),
            final_model_path: PathBuf::from("model_face_shape_xception.tar.gz"),
            export_dir: PathBuf::from("export"),
            logs_dir: PathBuf::from("runs_logs"),
            plots_dir: PathBuf::from("runs_plots"),
        }
    }
}

/// パイプライン設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// データセット設定
    pub dataset: DatasetSettings,
    /// バランス調整設定
    pub balance: BalanceSettings,
    /// データ拡張設定
    pub augmentation: AugmentationSettings,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 出力先設定
    pub output: OutputSettings,
}

impl PipelineConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// 設定を読み込む。存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {:#}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// 値の範囲をチェック
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.model.image_size > 0, "image_size must be positive");
        ensure!(self.training.batch_size > 0, "batch_size must be positive");
        ensure!(self.training.num_epochs > 0, "num_epochs must be positive");
        ensure!(
            self.training.validation_split > 0.0 && self.training.validation_split < 1.0,
            "validation_split must be in (0, 1), got {}",
            self.training.validation_split
        );
        ensure!(
            self.model.width_multiplier > 0.0,
            "width_multiplier must be positive, got {}",
            self.model.width_multiplier
        );
        for (name, p) in [("dropout_1", self.model.dropout_1), ("dropout_2", self.model.dropout_2)] {
            ensure!((0.0..1.0).contains(&p), "{} must be in [0, 1), got {}", name, p);
        }
        if self.balance.enabled {
            ensure!(self.balance.target_per_class > 0, "target_per_class must be positive");
        }
        Ok(())
    }

    /// バランス調整後に学習へ使うルート
    pub fn effective_train_dir(&self) -> &Path {
        if self.balance.enabled && !self.balance.in_place {
            &self.balance.work_dir
        } else {
            &self.dataset.train_dir
        }
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== パイプライン設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("学習データ: {}", self.dataset.train_dir.display());
        println!("テストデータ: {}", self.dataset.test_dir.display());
        println!("\n--- バランス調整 ---");
        println!("有効: {}", self.balance.enabled);
        println!("目標枚数: {}", self.balance.target_per_class);
        println!("インプレース: {}", self.balance.in_place);
        println!("\n--- モデル設定 ---");
        println!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        println!("前処理: {:?}", self.model.preprocessing);
        match &self.model.backbone_weights {
            Some(path) => println!("バックボーン重み: {}", path.display()),
            None => println!("バックボーン重み: (なし)"),
        }
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("検証割合: {}", self.training.validation_split);
        println!("patience: {}", self.training.patience);
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.training.num_epochs, 20);
        assert_eq!(config.training.patience, 6);
        assert_eq!(config.balance.target_per_class, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: PipelineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.hidden_units_1, deserialized.model.hidden_units_1);
        assert_eq!(config.augmentation.training, deserialized.augmentation.training);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "device_type": "Cpu", "training": { "num_epochs": 3 } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.model.image_size, 224);
    }

    #[test]
    fn test_validate_rejects_bad_split() {
        let mut config = PipelineConfig::default();
        config.training.validation_split = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_train_dir() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.effective_train_dir(), config.balance.work_dir.as_path());
        config.balance.in_place = true;
        assert_eq!(config.effective_train_dir(), config.dataset.train_dir.as_path());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
