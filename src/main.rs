use anyhow::Result;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use face_shape_lib::{pipeline, DeviceType, PipelineConfig};

/// 顔型分類モデルの学習パイプライン
#[derive(Parser, Debug)]
#[command(
    name = "face_shape",
    version,
    about = "Balance a face-shape dataset, train a classifier on a frozen Xception backbone, evaluate and export it."
)]
struct Cli {
    /// 設定ファイル（JSON）。省略時は ./config.json、無ければデフォルト設定
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// balance → train → evaluate → export をすべて実行
    Run,
    /// クラスバランス調整のみ
    Balance,
    /// 学習と評価
    Train,
    /// チェックポイントから推論用パッケージを書き出す
    Export {
        /// 元にするモデルパッケージ（省略時はチェックポイント）
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// クラス別枚数と学習・テスト間の重複ファイルを表示
    Inspect,
    /// timmのXception重み（.pth / .safetensors）をburnの .mpk に変換
    ImportWeights {
        /// 変換元（例: weights/xception-43020ad28.pth）
        source: PathBuf,
        /// 出力先（省略時は拡張子を .mpk に変えたパス）
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// デフォルト設定をファイルに書き出す
    InitConfig {
        /// 出力先
        #[arg(default_value = "config.json")]
        path: PathBuf,
    },
}

type CpuBackend = NdArray;
type GpuBackend = Wgpu;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("face_shape=info".parse()?)
                .add_directive("face_shape_lib=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    if let Command::InitConfig { path } = &cli.command {
        PipelineConfig::default().save(path)?;
        println!("デフォルト設定を書き出しました: {}", path.display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::load_or_default(PipelineConfig::default_path()),
    };
    config.validate()?;
    config.display();

    match config.device_type {
        DeviceType::Wgpu => {
            let device = WgpuDevice::default();
            tracing::info!("使用デバイス: {:?}", device);
            dispatch::<Autodiff<GpuBackend>>(&cli.command, &config, &device)
        }
        DeviceType::Cpu => {
            let device = NdArrayDevice::Cpu;
            tracing::info!("使用デバイス: CPU (NdArray)");
            dispatch::<Autodiff<CpuBackend>>(&cli.command, &config, &device)
        }
    }
}

fn dispatch<B: burn::tensor::backend::AutodiffBackend>(
    command: &Command,
    config: &PipelineConfig,
    device: &B::Device,
) -> Result<()> {
    match command {
        Command::Run => {
            let summary = pipeline::run_all::<B>(config, device)?;
            println!(
                "\n完了: テスト正解率 {:.4}, 最終モデル {}",
                summary.training.evaluation.accuracy,
                summary.training.final_model.display()
            );
        }
        Command::Balance => {
            pipeline::run_balance(config)?;
        }
        Command::Train => {
            let summary = pipeline::run_training::<B>(config, device)?;
            println!(
                "\n完了: テスト正解率 {:.4}, レポート {}",
                summary.evaluation.accuracy,
                summary.artifacts.report.display()
            );
        }
        Command::Export { source } => {
            pipeline::run_export::<B::InnerBackend>(config, source.as_deref(), device)?;
        }
        Command::Inspect => pipeline::run_inspect(config)?,
        Command::ImportWeights { source, output } => {
            pipeline::run_import_weights::<B::InnerBackend>(config, source, output.as_deref(), device)?;
        }
        Command::InitConfig { .. } => {}
    }
    Ok(())
}
