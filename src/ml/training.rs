//! 分類ヘッドの学習ループ
//!
//! バックボーンは内部バックエンド（自動微分なし）で推論モードのまま実行し、
//! 得られた特徴ベクトルだけを自動微分バックエンドに持ち上げてヘッドを学習します。

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::dataset::augment::RandomAffine;
use crate::ml::backbone::Xception;
use crate::ml::data::{DataStreams, ImageBatch, ImageBatcher};
use crate::ml::ml_model::{ClassifierHead, FaceShapeClassifier, ModelConfig, Preprocessing};
use crate::model::config::PipelineConfig;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::save_classifier;

/// 1エポック分の指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// 学習履歴
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// 検証正解率が最も高いエポック（同率なら先のエポック）
    pub fn best_by_val_accuracy(&self) -> Option<&EpochMetrics> {
        self.epochs.iter().fold(None, |best, m| match best {
            Some(b) if b.val_accuracy >= m.val_accuracy => Some(b),
            _ => Some(m),
        })
    }

    /// CSVとして書き出す（ヘッダ: epoch,train_loss,train_accuracy,val_loss,val_accuracy）
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create history file: {}", path.display()))?;
        for metrics in &self.epochs {
            writer.serialize(metrics)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// 検証損失による早期終了
///
/// 最良値を `patience` エポック連続で更新できなかったら停止します。
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f64::INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    /// 検証損失を記録し、最良値を更新したら true を返す（NaNは更新なし扱い）
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> bool {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            true
        } else {
            self.wait += 1;
            false
        }
    }

    pub fn should_stop(&self) -> bool {
        self.wait >= self.patience
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }
}

/// 学習結果
#[derive(Debug)]
pub struct TrainingOutcome<B: Backend> {
    /// 検証損失が最良だったエポックのヘッドを持つモデル
    pub model: FaceShapeClassifier<B>,
    pub history: TrainingHistory,
    /// 検証損失が最良だったエポック
    pub best_loss_epoch: Option<usize>,
    /// 検証正解率の最高値
    pub best_val_accuracy: Option<f64>,
    /// 最後に書き出したチェックポイント
    pub checkpoint: Option<PathBuf>,
    pub stopped_early: bool,
}

/// バッチ集計（損失はサンプル数で重み付け）
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl Tally {
    fn add(&mut self, mean_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += mean_loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    fn loss(&self) -> f64 {
        if self.total > 0 {
            self.loss_sum / self.total as f64
        } else {
            f64::NAN
        }
    }

    fn accuracy(&self) -> f64 {
        if self.total > 0 {
            self.correct as f64 / self.total as f64
        } else {
            0.0
        }
    }
}

/// 正解数を数える（argmaxは [batch, 1] を返すので平坦化してから比較）
pub(crate) fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    logits
        .argmax(1)
        .flatten::<1>(0, 1)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// ヘッドを学習する
///
/// - Adam + 交差エントロピー、ヘッドのパラメータのみ更新
/// - 検証正解率が前回の最高値を上回ったらチェックポイントを保存
/// - 検証損失が `patience` エポック改善しなければ停止し、最良損失時のヘッドに戻す
pub fn train<B: AutodiffBackend>(
    config: &PipelineConfig,
    model_config: &ModelConfig,
    streams: &DataStreams,
    backbone: Xception<B::InnerBackend>,
    device: &B::Device,
) -> Result<TrainingOutcome<B::InnerBackend>> {
    let settings = &config.training;
    let image_size = model_config.image_size;
    let preprocessing: Preprocessing = config.model.preprocessing;

    let mut head: ClassifierHead<B> = model_config.head_config().init(device);
    let mut optim = AdamConfig::new().init();

    // 学習用: 読み込みごとにランダム変換（シード固定）
    let augmenter = RandomAffine::new(config.augmentation.training.clone())?;
    let train_batcher = ImageBatcher::<B::InnerBackend>::new(device.clone(), image_size, preprocessing)
        .with_augmentation(augmenter, settings.seed);
    let train_check = train_batcher.clone();
    let train_loader = DataLoaderBuilder::new(train_batcher)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(0)
        .build(streams.train.clone());

    let valid_batcher = ImageBatcher::<B::InnerBackend>::new(device.clone(), image_size, preprocessing);
    let valid_check = valid_batcher.clone();
    let valid_loader = DataLoaderBuilder::new(valid_batcher)
        .batch_size(settings.batch_size)
        .num_workers(0)
        .build(streams.validation.clone());

    let train_loss_fn = CrossEntropyLossConfig::new().init::<B>(device);
    let valid_loss_fn = CrossEntropyLossConfig::new().init::<B::InnerBackend>(device);

    let mut history = TrainingHistory::default();
    let mut early_stopping = EarlyStopping::new(settings.patience);
    let mut best_head: Option<ClassifierHead<B::InnerBackend>> = None;
    let mut best_val_accuracy: Option<f64> = None;
    let mut checkpoint: Option<PathBuf> = None;
    let mut stopped_early = false;

    tracing::info!(
        "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}, patience {}",
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate,
        settings.patience
    );

    for epoch in 1..=settings.num_epochs {
        // ── 学習 ──
        let mut train_tally = Tally::default();
        for batch in train_loader.iter() {
            train_check.check()?;
            let ImageBatch { images, targets } = batch;
            let batch_size = targets.dims()[0];

            let features = Tensor::<B, 2>::from_inner(backbone.features(images));
            let targets = Tensor::<B, 1, Int>::from_inner(targets);

            let logits = head.forward(features);
            let loss = train_loss_fn.forward(logits.clone(), targets.clone());
            let loss_value = loss.clone().into_scalar().elem::<f64>();
            train_tally.add(loss_value, count_correct(logits, targets), batch_size);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &head);
            head = optim.step(settings.learning_rate, head, grads);
        }
        train_check.check()?;

        // ── 検証（ドロップアウト無効） ──
        let head_valid = head.valid();
        let mut valid_tally = Tally::default();
        for batch in valid_loader.iter() {
            valid_check.check()?;
            let batch_size = batch.targets.dims()[0];
            let logits = head_valid.forward(backbone.features(batch.images));
            let loss = valid_loss_fn.forward(logits.clone(), batch.targets.clone());
            valid_tally.add(
                loss.into_scalar().elem::<f64>(),
                count_correct(logits, batch.targets),
                batch_size,
            );
        }
        valid_check.check()?;

        let metrics = EpochMetrics {
            epoch,
            train_loss: train_tally.loss(),
            train_accuracy: train_tally.accuracy(),
            val_loss: valid_tally.loss(),
            val_accuracy: valid_tally.accuracy(),
        };
        history.push(metrics);
        tracing::info!(
            "Epoch {:>3}/{} | loss={:.4} acc={:.4} | val_loss={:.4} val_acc={:.4}",
            epoch,
            settings.num_epochs,
            metrics.train_loss,
            metrics.train_accuracy,
            metrics.val_loss,
            metrics.val_accuracy
        );

        // 検証正解率が更新されたらチェックポイント
        if best_val_accuracy.map_or(true, |best| metrics.val_accuracy > best) {
            best_val_accuracy = Some(metrics.val_accuracy);
            let metadata = ModelMetadata::new(
                streams.classes.clone(),
                model_config.clone(),
                preprocessing,
                epoch as u32,
            )
            .with_best_val_accuracy(metrics.val_accuracy);
            let model = FaceShapeClassifier::from_parts(backbone.clone(), head_valid.clone());
            let path = save_classifier(&config.output.checkpoint_path, model, &metadata)?;
            tracing::info!(
                "val_accuracy が {:.4} に改善しました。チェックポイントを保存: {}",
                metrics.val_accuracy,
                path.display()
            );
            checkpoint = Some(path);
        }

        if early_stopping.observe(epoch, metrics.val_loss) {
            best_head = Some(head_valid);
        } else if early_stopping.should_stop() {
            tracing::info!(
                "val_loss が {} エポック改善しなかったため学習を終了します（最良: epoch {:?}, {:.4}）",
                settings.patience,
                early_stopping.best_epoch(),
                early_stopping.best_loss()
            );
            stopped_early = true;
            break;
        }
    }

    // 最良損失時のヘッドに戻す（エポック上限に達した場合も同様）
    let final_head = match best_head {
        Some(head) => {
            tracing::info!("epoch {:?} の重みを復元しました", early_stopping.best_epoch());
            head
        }
        None => head.valid(),
    };

    Ok(TrainingOutcome {
        model: FaceShapeClassifier::from_parts(backbone, final_head),
        history,
        best_loss_epoch: early_stopping.best_epoch(),
        best_val_accuracy,
        checkpoint,
        stopped_early,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(epoch: usize, val_loss: f64, val_accuracy: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: 1.0,
            train_accuracy: 0.5,
            val_loss,
            val_accuracy,
        }
    }

    #[test]
    fn test_early_stopping_waits_for_patience() {
        let mut stopping = EarlyStopping::new(3);
        assert!(stopping.observe(1, 1.0));
        assert!(stopping.observe(2, 0.8));
        assert!(!stopping.observe(3, 0.8)); // 同値は改善ではない
        assert!(!stopping.observe(4, 0.9));
        assert!(!stopping.should_stop());
        assert!(!stopping.observe(5, 1.2));
        assert!(stopping.should_stop());
        assert_eq!(stopping.best_epoch(), Some(2));
    }

    #[test]
    fn test_early_stopping_resets_on_improvement() {
        let mut stopping = EarlyStopping::new(2);
        stopping.observe(1, 1.0);
        stopping.observe(2, 1.1);
        stopping.observe(3, 0.5);
        stopping.observe(4, 0.6);
        assert!(!stopping.should_stop());
        assert_eq!(stopping.best_epoch(), Some(3));
    }

    #[test]
    fn test_nan_loss_is_not_improvement() {
        let mut stopping = EarlyStopping::new(1);
        assert!(!stopping.observe(1, f64::NAN));
        assert!(stopping.should_stop());
        assert_eq!(stopping.best_epoch(), None);
    }

    #[test]
    fn test_best_by_val_accuracy_prefers_first() {
        let mut history = TrainingHistory::default();
        history.push(metrics(1, 1.0, 0.4));
        history.push(metrics(2, 0.9, 0.6));
        history.push(metrics(3, 0.8, 0.6));
        assert_eq!(history.best_by_val_accuracy().map(|m| m.epoch), Some(2));
    }

    #[test]
    fn test_history_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("training_history.csv");
        let mut history = TrainingHistory::default();
        history.push(metrics(1, 1.0, 0.4));
        history.push(metrics(2, 0.9, 0.6));
        history.write_csv(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(
            headers,
            ["epoch", "train_loss", "train_accuracy", "val_loss", "val_accuracy"]
        );
        let rows: Vec<EpochMetrics> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows, history.epochs);
    }

    #[test]
    fn test_tally() {
        let mut tally = Tally::default();
        tally.add(1.0, 1, 2);
        tally.add(4.0, 2, 2);
        assert_eq!(tally.loss(), 2.5);
        assert_eq!(tally.accuracy(), 0.75);
        assert!(Tally::default().loss().is_nan());
    }
}
