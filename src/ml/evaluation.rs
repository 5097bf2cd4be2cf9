//! テストデータでの評価
//!
//! 正解率、クラス別の precision / recall / F1、混同行列を計算し、
//! レポート・CSV・ヒートマップ画像として書き出します。

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    nn::loss::CrossEntropyLossConfig,
    tensor::{backend::Backend, ElementConversion},
};
use image::{Rgb, RgbImage};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::dataset::classes::ClassIndex;
use crate::ml::data::{ImageBatcher, ImageDataset};
use crate::ml::ml_model::{FaceShapeClassifier, Preprocessing};

pub const REPORT_FILE: &str = "classification_report_test.txt";
pub const MATRIX_FILE: &str = "confusion_matrix_test.csv";
pub const HEATMAP_FILE: &str = "confusion_matrix_test.png";

/// 混同行列（行: 正解クラス、列: 予測クラス）
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    classes: ClassIndex,
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(classes: ClassIndex) -> Self {
        let n = classes.len();
        Self {
            classes,
            counts: vec![vec![0; n]; n],
        }
    }

    /// 正解・予測のインデックス列から作る
    pub fn from_predictions(classes: ClassIndex, truth: &[usize], predicted: &[usize]) -> Self {
        let mut matrix = Self::new(classes);
        for (&t, &p) in truth.iter().zip(predicted) {
            matrix.add(t, p);
        }
        matrix
    }

    pub fn add(&mut self, truth: usize, predicted: usize) {
        self.counts[truth][predicted] += 1;
    }

    pub fn classes(&self) -> &ClassIndex {
        &self.classes
    }

    pub fn counts(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn get(&self, truth: usize, predicted: usize) -> usize {
        self.counts[truth][predicted]
    }

    /// 行和 = クラスごとのテストサンプル数
    pub fn row_sums(&self) -> Vec<usize> {
        self.counts.iter().map(|row| row.iter().sum()).collect()
    }

    /// 列和 = クラスごとの予測数
    pub fn column_sums(&self) -> Vec<usize> {
        (0..self.classes.len())
            .map(|c| self.counts.iter().map(|row| row[c]).sum())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.row_sums().iter().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.classes.len()).map(|i| self.counts[i][i]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// CSVで書き出す（1列目がクラス名、以降が予測クラス）
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create confusion matrix file: {}", path.display()))?;

        let mut header = vec![String::new()];
        header.extend(self.classes.names().iter().cloned());
        writer.write_record(&header)?;

        for (name, row) in self.classes.names().iter().zip(&self.counts) {
            let mut record = vec![name.clone()];
            record.extend(row.iter().map(|c| c.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// 行ごとに正規化した濃淡のヒートマップ画像を作る
    pub fn render_heatmap(&self, cell_size: u32) -> RgbImage {
        let n = self.classes.len() as u32;
        let row_sums = self.row_sums();
        let mut img = RgbImage::from_pixel(n * cell_size, n * cell_size, Rgb([255, 255, 255]));

        for (t, row) in self.counts.iter().enumerate() {
            for (p, &count) in row.iter().enumerate() {
                let intensity = ratio(count, row_sums[t]);
                // 白 → 青
                let fade = (255.0 * (1.0 - intensity)).round() as u8;
                let color = Rgb([fade, fade, 255]);
                for dy in 0..cell_size {
                    for dx in 0..cell_size {
                        img.put_pixel(p as u32 * cell_size + dx, t as u32 * cell_size + dy, color);
                    }
                }
            }
        }
        img
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// クラス別の指標
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMetrics {
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// 分類レポート（ゼロ除算は0.0）
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

impl ClassificationReport {
    pub fn from_confusion(matrix: &ConfusionMatrix) -> Self {
        let supports = matrix.row_sums();
        let predicted = matrix.column_sums();
        let total = matrix.total();

        let classes: Vec<ClassMetrics> = matrix
            .classes()
            .iter()
            .map(|(i, name)| {
                let tp = matrix.get(i, i);
                let precision = ratio(tp, predicted[i]);
                let recall = ratio(tp, supports[i]);
                ClassMetrics {
                    name: name.to_string(),
                    precision,
                    recall,
                    f1: f1(precision, recall),
                    support: supports[i],
                }
            })
            .collect();

        let n = classes.len().max(1) as f64;
        let macro_avg = ClassMetrics {
            name: "macro avg".to_string(),
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / n,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / n,
            f1: classes.iter().map(|c| c.f1).sum::<f64>() / n,
            support: total,
        };

        let weighted = |metric: fn(&ClassMetrics) -> f64| -> f64 {
            if total == 0 {
                0.0
            } else {
                classes.iter().map(|c| metric(c) * c.support as f64).sum::<f64>() / total as f64
            }
        };
        let weighted_avg = ClassMetrics {
            name: "weighted avg".to_string(),
            precision: weighted(|c| c.precision),
            recall: weighted(|c| c.recall),
            f1: weighted(|c| c.f1),
            support: total,
        };

        Self {
            classes,
            accuracy: matrix.accuracy(),
            macro_avg,
            weighted_avg,
        }
    }

    /// テキスト形式（小数点以下4桁）
    pub fn to_text(&self) -> String {
        let width = self
            .classes
            .iter()
            .map(|c| c.name.len())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(12);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>width$} {:>10} {:>10} {:>10} {:>10}\n",
            "", "precision", "recall", "f1-score", "support"
        );
        for c in &self.classes {
            let _ = writeln!(
                out,
                "{:>width$} {:>10.4} {:>10.4} {:>10.4} {:>10}",
                c.name, c.precision, c.recall, c.f1, c.support
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:>width$} {:>10} {:>10} {:>10.4} {:>10}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        );
        for c in [&self.macro_avg, &self.weighted_avg] {
            let _ = writeln!(
                out,
                "{:>width$} {:>10.4} {:>10.4} {:>10.4} {:>10}",
                c.name, c.precision, c.recall, c.f1, c.support
            );
        }
        out
    }
}

/// 評価結果
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
    pub report: ClassificationReport,
}

/// 書き出したファイル
#[derive(Debug, Clone)]
pub struct EvaluationArtifacts {
    pub report: PathBuf,
    pub matrix: PathBuf,
    /// 描画に失敗した場合は None
    pub heatmap: Option<PathBuf>,
}

impl Evaluation {
    /// レポートとCSVを `logs_dir` に、ヒートマップを `plots_dir` に書き出す
    ///
    /// ヒートマップの失敗は警告のみ。
    pub fn write_artifacts(&self, logs_dir: &Path, plots_dir: &Path) -> Result<EvaluationArtifacts> {
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create directory: {}", logs_dir.display()))?;

        let report = logs_dir.join(REPORT_FILE);
        std::fs::write(&report, self.report.to_text())
            .with_context(|| format!("Failed to write report: {}", report.display()))?;

        let matrix = logs_dir.join(MATRIX_FILE);
        self.confusion.write_csv(&matrix)?;

        let heatmap = match self.write_heatmap(plots_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("混同行列画像の保存に失敗しました: {:#}", e);
                None
            }
        };

        Ok(EvaluationArtifacts {
            report,
            matrix,
            heatmap,
        })
    }

    fn write_heatmap(&self, plots_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(plots_dir)?;
        let path = plots_dir.join(HEATMAP_FILE);
        self.confusion.render_heatmap(48).save(&path)?;
        Ok(path)
    }

    pub fn print_summary(&self) {
        println!("\nTest loss: {:.4} | Test accuracy: {:.4}", self.loss, self.accuracy);
        println!("\n{}", self.report.to_text());
    }
}

/// テストデータで評価する
///
/// 予測は出力分布のargmax。クラス名はテストデータのクラス一覧を使います。
pub fn evaluate<B: Backend>(
    model: &FaceShapeClassifier<B>,
    dataset: &ImageDataset,
    image_size: usize,
    preprocessing: Preprocessing,
    batch_size: usize,
    device: &B::Device,
) -> Result<Evaluation> {
    if dataset.len() == 0 {
        anyhow::bail!("test dataset is empty");
    }

    let batcher = ImageBatcher::<B>::new(device.clone(), image_size, preprocessing);
    let check = batcher.clone();
    let loader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .num_workers(0)
        .build(dataset.clone());
    let loss_fn = CrossEntropyLossConfig::new().init::<B>(device);

    let mut confusion = ConfusionMatrix::new(dataset.classes().clone());
    let mut loss_sum = 0.0;

    for batch in loader.iter() {
        check.check()?;
        let batch_size = batch.targets.dims()[0];
        let logits = model.forward(batch.images);
        let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
        loss_sum += loss.into_scalar().elem::<f64>() * batch_size as f64;

        let predicted: Vec<i64> = logits
            .argmax(1)
            .flatten::<1>(0, 1)
            .into_data()
            .iter::<i64>()
            .collect();
        let truth: Vec<i64> = batch.targets.into_data().iter::<i64>().collect();
        for (t, p) in truth.into_iter().zip(predicted) {
            confusion.add(t as usize, p as usize);
        }
    }
    check.check()?;

    let report = ClassificationReport::from_confusion(&confusion);
    let evaluation = Evaluation {
        loss: loss_sum / confusion.total().max(1) as f64,
        accuracy: confusion.accuracy(),
        confusion,
        report,
    };
    tracing::info!(
        "テスト評価: loss={:.4}, accuracy={:.4} ({} 枚)",
        evaluation.loss,
        evaluation.accuracy,
        evaluation.confusion.total()
    );
    Ok(evaluation)
}
