//! モデルパッケージの確認用バイナリ
//!
//! 使い方: inspect_model <package.tar.gz> [image ...]

use anyhow::Result;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::Parser;
use std::path::PathBuf;

use face_shape_lib::ml::InferenceEngine;
use face_shape_lib::model::{load_metadata, print_metadata_info};

/// モデルパッケージのメタデータ表示と推論確認
#[derive(Parser, Debug)]
#[command(name = "inspect_model", version)]
struct Args {
    /// 確認するパッケージ（.tar.gz）
    model: PathBuf,
    /// 分類を試す画像
    images: Vec<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("face_shape_lib=info".parse()?),
        )
        .init();

    let Args {
        model: model_path,
        images,
    } = Args::parse();

    println!("=== Model Package Check ===\n");

    // メタデータ
    let metadata = load_metadata(&model_path)?;
    println!("✓ モデルメタデータ読み込み成功:");
    print_metadata_info(&metadata);

    // 重みの読み込みとゼロ画像での推論
    let engine = InferenceEngine::<NdArray>::load(&model_path, NdArrayDevice::Cpu)?;
    let probs = engine.predict_blank()?;
    println!("\n✓ ゼロ画像の出力: {:?}", probs);

    if images.is_empty() {
        return Ok(());
    }

    println!("\n{}\n", "=".repeat(50));
    for path in &images {
        match engine.classify_image(path) {
            Ok(prediction) => {
                let distribution: Vec<String> = metadata
                    .class_names
                    .iter()
                    .map(|(i, name)| format!("{}={:.3}", name, prediction.probabilities[i]))
                    .collect();
                println!(
                    "{}: {} ({:.1}%)  [{}]",
                    path.display(),
                    prediction.class_name,
                    prediction.confidence() * 100.0,
                    distribution.join(", ")
                );
            }
            Err(e) => eprintln!("✗ {}: {:#}", path.display(), e),
        }
    }
    Ok(())
}
