//! 学習・検証・テスト用の画像ストリーム
//!
//! データセットは画像パスとクラスIDのみを保持し、画像はバッチ作成時に読み込みます。
//! クラスIDは常に外から渡された `ClassIndex` に従って割り当てます。

use anyhow::Result;
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::dataset::augment::RandomAffine;
use crate::dataset::classes::ClassIndex;
use crate::dataset::scan::list_images;
use crate::error::DatasetError;
use crate::ml::ml_model::{image_to_chw, load_resized_image, Preprocessing};
use crate::model::config::PipelineConfig;

/// 画像データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct ImageDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    classes: ClassIndex,
}

impl ImageDataset {
    /// ルート直下のクラスディレクトリから読み込む（クラス順・ファイル名順）
    ///
    /// `classes` に無いディレクトリは無視し、存在しないクラスディレクトリは警告のみ出します。
    pub fn from_class_dirs(root: &Path, classes: &ClassIndex) -> Result<Self> {
        if !root.is_dir() {
            return Err(DatasetError::MissingRoot(root.to_path_buf()).into());
        }

        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if classes.index_of(&name).is_none() {
                tracing::warn!("未知のクラスディレクトリを無視します: {}", path.display());
            }
        }

        let mut samples = Vec::new();
        for (class_id, class_name) in classes.iter() {
            let class_dir = root.join(class_name);
            if !class_dir.is_dir() {
                tracing::warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }
            for path in list_images(&class_dir)? {
                samples.push((path, class_id));
            }
        }

        Ok(Self {
            samples,
            classes: classes.clone(),
        })
    }

    pub fn classes(&self) -> &ClassIndex {
        &self.classes
    }

    pub fn class_names(&self) -> &[String] {
        self.classes.names()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }

    /// クラスごとのサンプル数（クラスID順）
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for (_, label) in &self.samples {
            counts[*label] += 1;
        }
        counts
    }

    /// 全画像のヘッダを読み、読めない画像があればエラーにする
    pub fn verify_readable(&self) -> Result<()> {
        for (path, _) in &self.samples {
            image::image_dimensions(path).map_err(|e| {
                anyhow::anyhow!("unreadable image {}: {}", path.display(), e)
            })?;
        }
        Ok(())
    }

    /// 学習用と検証用に分割する
    ///
    /// クラスごとにシードでシャッフルし、`round(n * validation_split)` 枚を検証用に回します。
    /// 同じシードなら同じ分割になり、両者は重なりません。
    pub fn split_validation(self, validation_split: f32, seed: u64) -> (Self, Self) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut valid = Vec::new();

        for class_id in 0..self.classes.len() {
            let mut class_samples: Vec<(PathBuf, usize)> = self
                .samples
                .iter()
                .filter(|(_, label)| *label == class_id)
                .cloned()
                .collect();
            class_samples.shuffle(&mut rng);

            let n_valid = (class_samples.len() as f32 * validation_split).round() as usize;
            let n_valid = n_valid.min(class_samples.len());
            let train_part = class_samples.split_off(n_valid);
            valid.extend(class_samples);
            train.extend(train_part);
        }

        // 検証用はシャッフルしないためクラス順・ファイル名順に戻す
        valid.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        train.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));

        (
            Self {
                samples: train,
                classes: self.classes.clone(),
            },
            Self {
                samples: valid,
                classes: self.classes,
            },
        )
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let (path, label) = self.samples.get(index)?;
        Some(ImageItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// 学習・検証・テストの3ストリーム
#[derive(Debug, Clone)]
pub struct DataStreams {
    pub classes: ClassIndex,
    pub train: ImageDataset,
    pub validation: ImageDataset,
    pub test: ImageDataset,
}

impl DataStreams {
    /// 設定に従って3ストリームを構築する
    pub fn build(config: &PipelineConfig, train_root: &Path, classes: &ClassIndex) -> Result<Self> {
        let full = ImageDataset::from_class_dirs(train_root, classes)?;
        if full.len() == 0 {
            return Err(DatasetError::NoSamples(train_root.to_path_buf()).into());
        }
        for (class_id, count) in full.class_counts().into_iter().enumerate() {
            if count == 0 {
                return Err(DatasetError::EmptyClass {
                    root: train_root.to_path_buf(),
                    class: classes.name(class_id).unwrap_or_default().to_string(),
                }
                .into());
            }
        }
        full.verify_readable()?;

        let (train, validation) =
            full.split_validation(config.training.validation_split, config.training.seed);

        let test = ImageDataset::from_class_dirs(&config.dataset.test_dir, classes)?;
        if test.len() == 0 {
            return Err(DatasetError::NoSamples(config.dataset.test_dir.clone()).into());
        }
        test.verify_readable()?;

        tracing::info!(
            "学習データ: {} 枚 / 検証データ: {} 枚 / テストデータ: {} 枚",
            train.len(),
            validation.len(),
            test.len()
        );
        tracing::info!("クラス順序: {}", classes.names().join(", "));

        Ok(Self {
            classes: classes.clone(),
            train,
            validation,
            test,
        })
    }
}

/// バッチャー
///
/// 画像を読み込み、正方形にリサイズ、（学習時のみ）ランダム変換、正規化を行います。
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    preprocessing: Preprocessing,
    augment: Option<(RandomAffine, Arc<Mutex<StdRng>>)>,
    // バッチ作成中に最初に起きた読み込みエラー（クローン間で共有）
    failure: Arc<Mutex<Option<String>>>,
}

impl<B: Backend> ImageBatcher<B> {
    /// 正規化のみ（検証・テスト用）
    pub fn new(device: B::Device, image_size: usize, preprocessing: Preprocessing) -> Self {
        Self {
            device,
            image_size,
            preprocessing,
            augment: None,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// 読み込みのたびにランダム変換をかける（学習用）
    pub fn with_augmentation(mut self, augmenter: RandomAffine, seed: u64) -> Self {
        self.augment = Some((augmenter, Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))));
        self
    }

    /// これまでのバッチで読み込みエラーがあればエラーを返す
    ///
    /// `Batcher::batch` はエラーを返せないため、ループ側でバッチごとに呼び出します。
    pub fn check(&self) -> Result<()> {
        let failure = self
            .failure
            .lock()
            .map_err(|_| anyhow::anyhow!("batcher failure lock poisoned"))?;
        match failure.as_ref() {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(()),
        }
    }

    fn record_failure(&self, message: String) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(message);
        }
    }

    fn load_item(&self, item: &ImageItem) -> Result<Vec<f32>> {
        let img = load_resized_image(&item.path, self.image_size)?;
        let img = match &self.augment {
            Some((augmenter, rng)) => {
                let mut rng = rng
                    .lock()
                    .map_err(|_| anyhow::anyhow!("augmentation rng lock poisoned"))?;
                augmenter.apply(&img, &mut *rng)
            }
            None => img,
        };
        Ok(image_to_chw(&img, self.preprocessing))
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            match self.load_item(&item) {
                Ok(data) => all_pixels.extend_from_slice(&data),
                Err(e) => {
                    // 形を保つためゼロで埋め、エラーは check() で呼び出し側に返す
                    tracing::error!("画像読み込み失敗 {}: {:#}", item.path.display(), e);
                    self.record_failure(format!(
                        "failed to load image {}: {:#}",
                        item.path.display(),
                        e
                    ));
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            targets.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}
