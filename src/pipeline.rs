//! パイプライン全体の実行
//!
//! balance → load → build → train → evaluate → export を1つの設定で順に実行します。
//! 各ステージは単独でも呼び出せます（CLIのサブコマンドに対応）。

use anyhow::{Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use std::path::{Path, PathBuf};

use crate::dataset::{
    balance_dataset, balance_in_place, count_images_per_class, find_common_images,
    print_class_counts, print_common_images, BalanceReport, ClassIndex,
};
use crate::ml::evaluation::{evaluate, Evaluation, EvaluationArtifacts};
use crate::ml::export::{export_model, ExportedModel};
use crate::ml::ml_model::ModelConfig;
use crate::ml::training::{train, TrainingHistory};
use crate::ml::DataStreams;
use crate::model::{package_path, save_classifier, ModelMetadata, PipelineConfig, Precision};

pub const HISTORY_FILE: &str = "training_history.csv";

/// 学習・評価ステージの結果
#[derive(Debug)]
pub struct TrainingSummary {
    pub classes: ClassIndex,
    pub history: TrainingHistory,
    pub evaluation: Evaluation,
    pub artifacts: EvaluationArtifacts,
    pub history_csv: PathBuf,
    pub checkpoint: Option<PathBuf>,
    pub final_model: PathBuf,
}

/// パイプライン全体の結果
#[derive(Debug)]
pub struct PipelineSummary {
    pub balance: Option<BalanceReport>,
    pub training: TrainingSummary,
    pub exported: Vec<ExportedModel>,
}

/// 学習ルートと（あれば）テストルートのクラス別枚数、重複ファイル名を表示
pub fn run_inspect(config: &PipelineConfig) -> Result<()> {
    let train_counts = count_images_per_class(&config.dataset.train_dir)?;
    println!("学習データ: {}", config.dataset.train_dir.display());
    print_class_counts(&train_counts);

    if config.dataset.test_dir.is_dir() {
        let test_counts = count_images_per_class(&config.dataset.test_dir)?;
        println!("テストデータ: {}", config.dataset.test_dir.display());
        print_class_counts(&test_counts);

        let common = find_common_images(&config.dataset.train_dir, &config.dataset.test_dir)?;
        print_common_images(&common);
    } else {
        tracing::warn!("テストデータがありません: {}", config.dataset.test_dir.display());
    }
    Ok(())
}

/// クラスバランス調整
///
/// 無効な場合は何もしない。通常は作業ディレクトリへコピーしてから調整し、
/// `in_place` の場合のみ学習ルートを直接書き換えます。
pub fn run_balance(config: &PipelineConfig) -> Result<Option<BalanceReport>> {
    if !config.balance.enabled {
        tracing::info!("クラスバランス調整は無効です");
        return Ok(None);
    }

    let source = &config.dataset.train_dir;
    let classes = ClassIndex::discover_expecting(source, config.dataset.expected_num_classes)?;
    let augment = &config.augmentation.balancing;
    let seed = config.training.seed;

    tracing::info!(
        "クラスバランス調整を開始します（目標 {} 枚/クラス）",
        config.balance.target_per_class
    );
    let report = if config.balance.in_place {
        tracing::warn!("学習ルートを直接書き換えます: {}", source.display());
        balance_in_place(source, &classes, config.balance.target_per_class, augment, seed)?
    } else {
        balance_dataset(
            source,
            &config.balance.work_dir,
            &classes,
            &config.balance,
            augment,
            seed,
        )?
    };
    report.print_summary();
    Ok(Some(report))
}

/// 学習と評価
///
/// 学習に使うルートはバランス調整の設定に従います（`effective_train_dir`）。
pub fn run_training<B: AutodiffBackend>(
    config: &PipelineConfig,
    device: &B::Device,
) -> Result<TrainingSummary> {
    config.validate()?;

    // load
    let train_root = config.effective_train_dir();
    let classes = ClassIndex::discover_expecting(train_root, config.dataset.expected_num_classes)
        .with_context(|| format!("Failed to read training root: {}", train_root.display()))?;
    let streams = DataStreams::build(config, train_root, &classes)?;

    // build
    let model_config = ModelConfig::from_settings(&config.model, classes.len());
    let model = model_config.init_pretrained::<B::InnerBackend>(
        config.model.backbone_weights.as_deref(),
        device,
    )?;
    let (backbone, _) = model.into_parts();

    // train
    let outcome = train::<B>(config, &model_config, &streams, backbone, device)?;
    let history_csv = config.output.logs_dir.join(HISTORY_FILE);
    outcome.history.write_csv(&history_csv)?;
    tracing::info!("学習履歴を保存しました: {}", history_csv.display());

    // evaluate
    let evaluation = evaluate(
        &outcome.model,
        &streams.test,
        model_config.image_size,
        config.model.preprocessing,
        config.training.batch_size,
        device,
    )?;
    evaluation.print_summary();
    let artifacts = evaluation.write_artifacts(&config.output.logs_dir, &config.output.plots_dir)?;

    let mut metadata = ModelMetadata::new(
        classes.clone(),
        model_config,
        config.model.preprocessing,
        outcome.history.len() as u32,
    )
    .with_test_accuracy(evaluation.accuracy);
    if let Some(acc) = outcome.best_val_accuracy {
        metadata = metadata.with_best_val_accuracy(acc);
    }
    let final_model = save_classifier(&config.output.final_model_path, outcome.model, &metadata)?;
    tracing::info!("最終モデルを保存しました: {}", final_model.display());

    // 学習に使ったクラス別枚数
    print_class_counts(&count_images_per_class(train_root)?);

    Ok(TrainingSummary {
        classes,
        history: outcome.history,
        evaluation,
        artifacts,
        history_csv,
        checkpoint: outcome.checkpoint,
        final_model,
    })
}

/// チェックポイント（または指定パッケージ）からエクスポート
pub fn run_export<B: Backend>(
    config: &PipelineConfig,
    source: Option<&Path>,
    device: &B::Device,
) -> Result<Vec<ExportedModel>> {
    let source = match source {
        Some(path) => path.to_path_buf(),
        None => package_path(&config.output.checkpoint_path),
    };
    let exported = export_model::<B>(
        &source,
        &config.output.export_dir,
        &[Precision::Full, Precision::Half],
        device,
    )?;
    for model in &exported {
        println!(
            "エクスポート完了 [{}]: {} ({:.2} MB)",
            model.precision,
            model.path.display(),
            model.size_bytes as f64 / 1024.0 / 1024.0
        );
    }
    Ok(exported)
}

/// 外部の事前学習済み重み（timmの `.pth` / `.safetensors`）をburnの `.mpk` に変換
///
/// バックボーンの構成は `model` 設定に従います。`output` を省略すると `source` の拡張子を `.mpk` に変えたパス。
pub fn run_import_weights<B: Backend>(
    config: &PipelineConfig,
    source: &Path,
    output: Option<&Path>,
    device: &B::Device,
) -> Result<PathBuf> {
    let backbone = ModelConfig::from_settings(&config.model, 1)
        .backbone
        .init::<B>(device)
        .load_pretrained(source, device)?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| source.with_extension("mpk"));
    let saved = backbone.save_record_file(&output)?;
    println!("バックボーン重みを変換しました: {} -> {}", source.display(), saved.display());
    Ok(saved)
}

/// 全ステージを実行
pub fn run_all<B: AutodiffBackend>(config: &PipelineConfig, device: &B::Device) -> Result<PipelineSummary> {
    config.validate()?;

    let balance = run_balance(config)?;
    let training = run_training::<B>(config, device)?;
    let source = training
        .checkpoint
        .clone()
        .unwrap_or_else(|| training.final_model.clone());
    let exported = run_export::<B::InnerBackend>(config, Some(&source), device)?;

    tracing::info!("パイプラインが完了しました");
    Ok(PipelineSummary {
        balance,
        training,
        exported,
    })
}
