//! 結合テスト用の共通フィクスチャ
//!
//! クラスごとに色味の違う合成画像を書き出し、CPUバックエンド向けに小さくした設定を返します。

#![allow(dead_code)]

use burn_ndarray::{NdArray, NdArrayDevice};
use burn_store::{BurnToPyTorchAdapter, KeyRemapper, ModuleSnapshot, SafetensorsStore};
use face_shape_lib::ml::{timm_key_prefixes, ModelConfig, Xception};
use face_shape_lib::model::config::{DeviceType, PipelineConfig};
use image::{Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};

pub const CLASSES: [&str; 5] = ["Heart", "Oblong", "Oval", "Round", "Square"];

const BASE_COLORS: [[u8; 3]; 5] = [
    [220, 40, 40],
    [40, 200, 40],
    [40, 40, 220],
    [220, 220, 40],
    [40, 220, 220],
];

/// 1クラス分のノイズ入り32x32画像を `<prefix><class>_<i>.png` として `count` 枚書き出す
pub fn write_class_images(dir: &Path, class_id: usize, count: usize, prefix: &str, seed: u64) {
    fs::create_dir_all(dir).unwrap();
    let mut rng = StdRng::seed_from_u64(seed + class_id as u64);
    let base = BASE_COLORS[class_id % BASE_COLORS.len()];
    for i in 0..count {
        let img = RgbImage::from_fn(32, 32, |_, _| {
            let mut px = base;
            for channel in px.iter_mut() {
                let noise: i16 = rng.gen_range(-20..=20);
                *channel = (*channel as i16 + noise).clamp(0, 255) as u8;
            }
            Rgb(px)
        });
        img.save(dir.join(format!("{prefix}{}_{i}.png", CLASSES[class_id])))
            .unwrap();
    }
}

/// クラスごとに `train_per_class` / `test_per_class` 枚を持つ学習・テストルート
pub struct Fixture {
    pub train_dir: PathBuf,
    pub test_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl Fixture {
    pub fn new(root: &Path, train_per_class: usize, test_per_class: usize) -> Self {
        let train_dir = root.join("train");
        let test_dir = root.join("test");
        for class_id in 0..CLASSES.len() {
            write_class_images(&train_dir.join(CLASSES[class_id]), class_id, train_per_class, "train_", 1);
            write_class_images(&test_dir.join(CLASSES[class_id]), class_id, test_per_class, "test_", 2);
        }
        Self {
            train_dir,
            test_dir,
            out_dir: root.join("out"),
        }
    }

    /// 極小バックボーン、事前学習済み重みなし、出力はすべて `out_dir` の下
    pub fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.device_type = DeviceType::Cpu;

        config.dataset.train_dir = self.train_dir.clone();
        config.dataset.test_dir = self.test_dir.clone();
        config.dataset.expected_num_classes = Some(CLASSES.len());

        config.balance.work_dir = self.out_dir.join("balanced_train");
        config.balance.target_per_class = 14;

        config.model.image_size = 32;
        config.model.backbone_weights = None;
        config.model.width_multiplier = 0.0625;
        config.model.middle_blocks = 0;
        config.model.hidden_units_1 = 16;
        config.model.hidden_units_2 = 8;

        config.training.num_epochs = 3;
        config.training.batch_size = 8;
        config.training.learning_rate = 1e-3;

        config.output.checkpoint_path = self.out_dir.join("best.tar.gz");
        config.output.final_model_path = self.out_dir.join("final.tar.gz");
        config.output.export_dir = self.out_dir.join("export");
        config.output.logs_dir = self.out_dir.join("logs");
        config.output.plots_dir = self.out_dir.join("plots");
        config
    }
}

/// 設定どおりのバックボーンをランダム初期化し、timmの命名でsafetensorsに書き出す
pub fn write_timm_backbone(path: &Path, config: &PipelineConfig) -> Xception<NdArray> {
    let backbone = ModelConfig::from_settings(&config.model, CLASSES.len())
        .backbone
        .init::<NdArray>(&NdArrayDevice::Cpu);
    let to_timm = KeyRemapper::from_pattern_iter(
        timm_key_prefixes(config.model.middle_blocks)
            .into_iter()
            .map(|(timm, burn)| (format!("^{}", burn.replace('.', r"\.")), timm)),
    )
    .unwrap();

    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut store = SafetensorsStore::from_file(path)
        .with_to_adapter(BurnToPyTorchAdapter)
        .remap(to_timm);
    backbone.save_into(&mut store).unwrap();
    backbone
}
