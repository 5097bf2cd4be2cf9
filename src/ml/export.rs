//! 推論用パッケージのエクスポート
//!
//! チェックポイントを読み込み、f32版と重みのみf16に落とした軽量版を書き出します。
//! 書き出した各パッケージは読み戻してゼロ画像で推論し、確率分布が得られることを確認します。

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Tensor};
use std::path::{Path, PathBuf};

use crate::ml::ml_model::FaceShapeClassifier;
use crate::model::model_metadata::{ModelMetadata, Precision};
use crate::model::model_storage::{load_classifier, save_classifier};

/// 出力ファイル名: `faceshape_<suffix>.tar.gz`
pub fn export_file_name(precision: Precision) -> String {
    format!("faceshape_{}.tar.gz", precision.file_suffix())
}

/// エクスポート結果
#[derive(Debug, Clone)]
pub struct ExportedModel {
    pub precision: Precision,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// ゼロ画像1枚で推論し、確率分布になっているか確認する
pub fn verify_distribution<B: Backend>(
    model: &FaceShapeClassifier<B>,
    metadata: &ModelMetadata,
    device: &B::Device,
) -> Result<Vec<f32>> {
    let size = metadata.image_size();
    let input = Tensor::<B, 4>::zeros([1, 3, size, size], device);
    let probs: Vec<f32> = model
        .predict_proba(input)
        .into_data()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

    if probs.len() != metadata.num_classes() {
        anyhow::bail!(
            "expected {} outputs, got {}",
            metadata.num_classes(),
            probs.len()
        );
    }
    if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
        anyhow::bail!("output is not a probability distribution: {:?}", probs);
    }
    let sum: f32 = probs.iter().sum();
    if (sum - 1.0).abs() > 1e-3 {
        anyhow::bail!("probabilities sum to {} instead of 1", sum);
    }
    Ok(probs)
}

/// パッケージを読み込んで各精度で書き出す
///
/// `source` が無い・壊れている場合はエラー。
pub fn export_model<B: Backend>(
    source: &Path,
    out_dir: &Path,
    variants: &[Precision],
    device: &B::Device,
) -> Result<Vec<ExportedModel>> {
    if !source.exists() {
        anyhow::bail!("model package not found: {}", source.display());
    }
    let (metadata, model) = load_classifier::<B>(source, device)?;
    tracing::info!(
        "エクスポート元: {} ({} クラス)",
        source.display(),
        metadata.num_classes()
    );

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create export directory: {}", out_dir.display()))?;

    let mut exported = Vec::with_capacity(variants.len());
    for &precision in variants {
        let variant_meta = metadata.clone().with_precision(precision);
        let path = save_classifier(
            &out_dir.join(export_file_name(precision)),
            model.clone(),
            &variant_meta,
        )?;

        // 読み戻して検証
        let (_, reloaded) = load_classifier::<B>(&path, device)?;
        let probs = verify_distribution(&reloaded, &variant_meta, device)
            .with_context(|| format!("Verification failed for {}", path.display()))?;

        let size_bytes = std::fs::metadata(&path)?.len();
        tracing::info!(
            "{} を保存しました ({:.2} MB), ゼロ画像の出力: {:?}",
            path.display(),
            size_bytes as f64 / 1024.0 / 1024.0,
            probs
        );
        exported.push(ExportedModel {
            precision,
            path,
            size_bytes,
        });
    }

    Ok(exported)
}
