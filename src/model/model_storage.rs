//! モデルパッケージの保存と読み込み
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、モデル構成、精度など）
//! - model.bin       - モデルの重み（burnのNamedMpkレコード）

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{FullPrecisionSettings, HalfPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::ml::layout::{ensure_same_shapes, parameter_shapes};
use crate::ml::ml_model::FaceShapeClassifier;
use crate::model::model_metadata::{ModelMetadata, Precision};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 出力パスを `.tar.gz` に揃える
pub fn package_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 保存したパッケージのパスを返します。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = package_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // gzipの終端まで書き切る
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize tar.gz archive")?;

    Ok(tar_gz_path)
}

/// パッケージ内の指定エントリを読み出す
fn read_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut found = vec![None; wanted.len()];
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        if let Some(slot) = wanted.iter().position(|w| *w == name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found[slot] = Some(buffer);
        }
    }
    Ok(found)
}

fn parse_metadata(bytes: Vec<u8>) -> Result<ModelMetadata> {
    let json = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut found = read_entries(tar_gz_path, &[METADATA_ENTRY])?;
    let bytes = found
        .remove(0)
        .ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))?;
    parse_metadata(bytes)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut found = read_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?;
    let binary = found.pop().flatten();
    let metadata = found.pop().flatten();

    match (metadata, binary) {
        (Some(metadata), Some(binary)) => Ok((parse_metadata(metadata)?, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// モデルの重みを指定精度のバイナリに変換
pub fn encode_classifier<B: Backend>(
    model: FaceShapeClassifier<B>,
    precision: Precision,
) -> Result<Vec<u8>> {
    let record = model.into_record();
    let bytes = match precision {
        Precision::Full => {
            let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
            <NamedMpkBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(&recorder, record, ())
        }
        Precision::Half => {
            let recorder = NamedMpkBytesRecorder::<HalfPrecisionSettings>::default();
            <NamedMpkBytesRecorder<HalfPrecisionSettings> as Recorder<B>>::record(&recorder, record, ())
        }
    };
    bytes.map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

/// バイナリから重みを復元する（モデル構造はメタデータから作成）
///
/// 壊れたバイナリや、メタデータの構成と形状が合わない重みはエラーになります。
pub fn decode_classifier<B: Backend>(
    metadata: &ModelMetadata,
    model_binary: Vec<u8>,
    device: &B::Device,
) -> Result<FaceShapeClassifier<B>> {
    let model = metadata.model_config.init::<B>(device);
    let record = match metadata.precision {
        Precision::Full => {
            let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
            <NamedMpkBytesRecorder<FullPrecisionSettings> as Recorder<B>>::load(&recorder, model_binary, device)
        }
        Precision::Half => {
            let recorder = NamedMpkBytesRecorder::<HalfPrecisionSettings>::default();
            <NamedMpkBytesRecorder<HalfPrecisionSettings> as Recorder<B>>::load(&recorder, model_binary, device)
        }
    }
    .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    model.ensure_record_layout(&record)?;
    let expected = parameter_shapes::<B, _>(&model);
    let model = model.load_record(record);
    ensure_same_shapes(&expected, &parameter_shapes::<B, _>(&model))?;
    Ok(model)
}

/// モデルをパッケージとして保存（精度はメタデータに従う）
///
/// メタデータの構成と重みの形状が一致しない場合は書き出しません。
pub fn save_classifier<B: Backend>(
    output_path: &Path,
    model: FaceShapeClassifier<B>,
    metadata: &ModelMetadata,
) -> Result<PathBuf> {
    if let Some(device) = model.devices().first() {
        let expected = parameter_shapes::<B, _>(&metadata.model_config.init::<B>(device));
        ensure_same_shapes(&expected, &parameter_shapes::<B, _>(&model))
            .context("Model weights do not match the metadata model config")?;
    }
    let binary = encode_classifier(model, metadata.precision)?;
    let path = save_model_with_metadata(output_path, metadata, &binary)?;
    tracing::debug!(
        "モデルを保存しました: {} ({:.2} MB, {})",
        path.display(),
        binary.len() as f64 / 1024.0 / 1024.0,
        metadata.precision
    );
    Ok(path)
}

/// パッケージからモデルを読み込む
pub fn load_classifier<B: Backend>(
    tar_gz_path: &Path,
    device: &B::Device,
) -> Result<(ModelMetadata, FaceShapeClassifier<B>)> {
    let (metadata, binary) = load_model_with_metadata(tar_gz_path)
        .with_context(|| format!("Failed to read model package: {}", tar_gz_path.display()))?;
    let model = decode_classifier::<B>(&metadata, binary, device)
        .with_context(|| format!("Incompatible model package: {}", tar_gz_path.display()))?;
    Ok((metadata, model))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラス ({}): {}", metadata.num_classes(), metadata.class_names.names().join(", "));
    println!("入力サイズ: {}x{}", metadata.image_size(), metadata.image_size());
    println!("前処理: {:?}", metadata.preprocessing);
    println!(
        "バックボーン: Xception (width x{}, middle {})",
        metadata.model_config.backbone.width_multiplier, metadata.model_config.backbone.middle_blocks
    );
    println!(
        "ヘッド: {} -> {} -> {}",
        metadata.model_config.hidden_1, metadata.model_config.hidden_2, metadata.model_config.num_classes
    );
    println!("精度: {}", metadata.precision);
    println!("学習エポック数: {}", metadata.num_epochs);
    if let Some(acc) = metadata.best_val_accuracy {
        println!("検証正解率(最高): {:.4}", acc);
    }
    if let Some(acc) = metadata.test_accuracy {
        println!("テスト正解率: {:.4}", acc);
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::classes::ClassIndex;
    use crate::ml::backbone::XceptionConfig;
    use crate::ml::ml_model::{ModelConfig, Preprocessing};
    use burn::tensor::Tensor;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn tiny_metadata() -> ModelMetadata {
        let config = ModelConfig::new(
            3,
            XceptionConfig::new()
                .with_width_multiplier(0.0625)
                .with_middle_blocks(0),
        )
        .with_image_size(32)
        .with_hidden_1(16)
        .with_hidden_2(8);
        ModelMetadata::new(
            ClassIndex::from_names(["a", "b", "c"]),
            config,
            Preprocessing::Xception,
            1,
        )
    }

    #[test]
    fn test_package_path() {
        assert_eq!(package_path(Path::new("out/model")), PathBuf::from("out/model.tar.gz"));
        assert_eq!(package_path(Path::new("m.tar.gz")), PathBuf::from("m.tar.gz"));
    }

    #[test]
    fn test_missing_entry_is_error() {
        let dir = tempdir().unwrap();
        let path = save_model_with_metadata(&dir.path().join("pkg"), &tiny_metadata(), b"").unwrap();
        assert!(load_metadata(&path).is_ok());
        assert!(load_classifier::<TestBackend>(&path, &NdArrayDevice::Cpu).is_err());
        assert!(load_metadata(&dir.path().join("missing.tar.gz")).is_err());
    }

    #[test]
    fn test_truncated_weights_are_error() {
        let device = NdArrayDevice::Cpu;
        let dir = tempdir().unwrap();
        let metadata = tiny_metadata();
        let binary = encode_classifier(metadata.model_config.init::<TestBackend>(&device), Precision::Full).unwrap();

        let path = save_model_with_metadata(
            &dir.path().join("truncated"),
            &metadata,
            &binary[..binary.len() / 2],
        )
        .unwrap();
        let err = load_classifier::<TestBackend>(&path, &device).unwrap_err();
        assert!(format!("{:#}", err).contains("Incompatible model package"));
    }

    #[test]
    fn test_weights_from_other_config_are_error() {
        let device = NdArrayDevice::Cpu;
        let dir = tempdir().unwrap();
        let metadata = tiny_metadata();

        // メタデータは hidden_1=16、重みは hidden_1=32
        let wider = metadata.model_config.clone().with_hidden_1(32);
        let binary = encode_classifier(wider.init::<TestBackend>(&device), Precision::Full).unwrap();
        let path = save_model_with_metadata(&dir.path().join("wider"), &metadata, &binary).unwrap();
        let err = load_classifier::<TestBackend>(&path, &device).unwrap_err();
        assert!(format!("{:#}", err).contains("shape mismatch"));

        // middle flowのブロック数が違う
        let mut deeper = metadata.model_config.clone();
        deeper.backbone = deeper.backbone.clone().with_middle_blocks(1);
        let binary = encode_classifier(deeper.init::<TestBackend>(&device), Precision::Full).unwrap();
        let path = save_model_with_metadata(&dir.path().join("deeper"), &metadata, &binary).unwrap();
        assert!(load_classifier::<TestBackend>(&path, &device).is_err());
    }

    #[test]
    fn test_save_rejects_mismatched_metadata() {
        let device = NdArrayDevice::Cpu;
        let dir = tempdir().unwrap();
        let metadata = tiny_metadata();
        let wider = metadata.model_config.clone().with_hidden_1(32).init::<TestBackend>(&device);

        let path = dir.path().join("model.tar.gz");
        assert!(save_classifier(&path, wider, &metadata).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_classifier_survives_package() {
        let device = NdArrayDevice::Cpu;
        let dir = tempdir().unwrap();
        let metadata = tiny_metadata();
        let model = metadata.model_config.init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let expected: Vec<f32> = model.forward(input.clone()).into_data().to_vec().unwrap();

        let path = save_classifier(&dir.path().join("nested/model.tar.gz"), model, &metadata).unwrap();
        let (loaded_meta, loaded) = load_classifier::<TestBackend>(&path, &device).unwrap();
        assert_eq!(loaded_meta.class_names, metadata.class_names);

        let actual: Vec<f32> = loaded.forward(input).into_data().to_vec().unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-5);
        }
    }
}
