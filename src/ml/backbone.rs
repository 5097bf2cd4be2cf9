//! Xceptionバックボーン（特徴抽出器）
//!
//! # アーキテクチャ
//! - Entry flow: Conv 3x3/2 (32) → Conv 3x3 (64) → 残差ブロック 128, 256, 728（各ブロックで1/2）
//! - Middle flow: 残差ブロック 728 × `middle_blocks`（separable conv 3層）
//! - Exit flow: 残差ブロック 728→1024（1/2）→ SepConv 1536 → SepConv 2048
//!
//! 各チャネル数には `width_multiplier` を掛けます（最小8）。
//! 学習時は推論モード（BatchNormは移動平均を使用）で固定したまま使います。
//!
//! # 事前学習済み重み
//! - `.mpk`: このモジュール構成で保存したburnのNamedMpkレコード
//! - `.pth` / `.pt` / `.safetensors`: timm の `legacy_xception`（ImageNet-1k）の state_dict。
//!   配布ファイルは `xception-43020ad28.pth`（timm v0.1-cadene リリース）。
//!   キー名は [`timm_key_prefixes`] で読み替えます。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use burn_store::{KeyRemapper, ModuleSnapshot, PytorchStore, SafetensorsStore};
use std::path::Path;

use crate::ml::layout::{ensure_same_shapes, parameter_shapes};

/// entry flow（3）と exit flow（1）の残差ブロック数
const FIXED_BLOCKS: usize = 4;
/// timmのXceptionが持つmiddle flowのブロック数
const TIMM_MIDDLE_BLOCKS: usize = 8;

/// バックボーン設定
#[derive(Config, Debug)]
pub struct XceptionConfig {
    /// チャネル幅の倍率
    #[config(default = 1.0)]
    pub width_multiplier: f64,
    /// middle flowのブロック数
    #[config(default = 8)]
    pub middle_blocks: usize,
}

impl XceptionConfig {
    fn channels(&self, base: usize) -> usize {
        ((base as f64 * self.width_multiplier).round() as usize).max(8)
    }

    /// プーリング後の特徴次元
    pub fn feature_dim(&self) -> usize {
        self.channels(2048)
    }

    /// バックボーンを初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Xception<B> {
        let c32 = self.channels(32);
        let c64 = self.channels(64);
        let c128 = self.channels(128);
        let c256 = self.channels(256);
        let c728 = self.channels(728);
        let c1024 = self.channels(1024);
        let c1536 = self.channels(1536);
        let c2048 = self.channels(2048);

        let mut blocks = Vec::with_capacity(4 + self.middle_blocks);

        // Entry flow（最初のブロックは直前のConvのReLUを引き継ぐ）
        blocks.push(XceptionBlock::downsample(c64, &[c128, c128], false, device));
        blocks.push(XceptionBlock::downsample(c128, &[c256, c256], true, device));
        blocks.push(XceptionBlock::downsample(c256, &[c728, c728], true, device));

        // Middle flow
        for _ in 0..self.middle_blocks {
            blocks.push(XceptionBlock::identity(c728, 3, device));
        }

        // Exit flow
        blocks.push(XceptionBlock::downsample(c728, &[c728, c1024], true, device));

        Xception {
            stem1: ConvBn::new(3, c32, 3, 2, device),
            stem2: ConvBn::new(c32, c64, 3, 1, device),
            blocks,
            exit_conv1: SeparableConv::new(c1024, c1536, device),
            exit_conv2: SeparableConv::new(c1536, c2048, device),
            activation: Relu::new(),
        }
    }
}

/// 通常の畳み込み + BatchNorm（paddingなし）
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(in_channels: usize, out_channels: usize, kernel: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Depthwise 3x3 + Pointwise 1x1 + BatchNorm（サイズ維持）
#[derive(Module, Debug)]
pub struct SeparableConv<B: Backend> {
    depthwise: Conv2d<B>,
    pointwise: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> SeparableConv<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            depthwise: Conv2dConfig::new([in_channels, in_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_groups(in_channels)
                .with_bias(false)
                .init(device),
            pointwise: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.depthwise.forward(x);
        let x = self.pointwise.forward(x);
        self.bn.forward(x)
    }
}

/// 残差ブロック
///
/// - 縮小ブロック: [ReLU → SepConv] × n → MaxPool 3x3/2、ショートカットは Conv 1x1/2 + BN
/// - 恒等ブロック: [ReLU → SepConv] × n、ショートカットはそのまま加算
#[derive(Module, Debug)]
pub struct XceptionBlock<B: Backend> {
    convs: Vec<SeparableConv<B>>,
    pool: Option<MaxPool2d>,
    shortcut: Option<ConvBn<B>>,
    relu_first: bool,
    activation: Relu,
}

impl<B: Backend> XceptionBlock<B> {
    fn downsample(in_channels: usize, outs: &[usize], relu_first: bool, device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(outs.len());
        let mut channels = in_channels;
        for &out in outs {
            convs.push(SeparableConv::new(channels, out, device));
            channels = out;
        }

        Self {
            convs,
            pool: Some(
                MaxPool2dConfig::new([3, 3])
                    .with_strides([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(),
            ),
            shortcut: Some(ConvBn::new(in_channels, channels, 1, 2, device)),
            relu_first,
            activation: Relu::new(),
        }
    }

    fn identity(channels: usize, depth: usize, device: &B::Device) -> Self {
        Self {
            convs: (0..depth)
                .map(|_| SeparableConv::new(channels, channels, device))
                .collect(),
            pool: None,
            shortcut: None,
            relu_first: true,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.shortcut {
            Some(shortcut) => shortcut.forward(input.clone()),
            None => input.clone(),
        };

        let mut x = input;
        for (i, conv) in self.convs.iter().enumerate() {
            if i > 0 || self.relu_first {
                x = self.activation.forward(x);
            }
            x = conv.forward(x);
        }
        if let Some(pool) = &self.pool {
            x = pool.forward(x);
        }

        x + residual
    }
}

/// Xception特徴抽出器
#[derive(Module, Debug)]
pub struct Xception<B: Backend> {
    stem1: ConvBn<B>,
    stem2: ConvBn<B>,
    blocks: Vec<XceptionBlock<B>>,
    exit_conv1: SeparableConv<B>,
    exit_conv2: SeparableConv<B>,
    activation: Relu,
}

impl<B: Backend> Xception<B> {
    /// 特徴マップを返す
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - [batch_size, feature_dim, h, w]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.stem1.forward(images));
        let mut x = self.activation.forward(self.stem2.forward(x));

        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = self.activation.forward(self.exit_conv1.forward(x));
        self.activation.forward(self.exit_conv2.forward(x))
    }

    /// Global Average Poolingした特徴ベクトル [batch_size, feature_dim]
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        global_average_pool(self.forward(images))
    }

    /// middle flowのブロック数
    pub fn middle_blocks(&self) -> usize {
        self.blocks.len().saturating_sub(FIXED_BLOCKS)
    }

    /// レコードのブロック構成が一致するか確認する
    ///
    /// Vecの長さが違うレコードを `load_record` に渡すとpanicするため、先に弾きます。
    pub fn ensure_record_layout(&self, record: &XceptionRecord<B>) -> Result<()> {
        if self.blocks.len() != record.blocks.len() {
            anyhow::bail!(
                "backbone has {} residual blocks, weights have {}",
                self.blocks.len(),
                record.blocks.len()
            );
        }
        for (i, (block, saved)) in self.blocks.iter().zip(&record.blocks).enumerate() {
            if block.convs.len() != saved.convs.len() {
                anyhow::bail!(
                    "block {}: {} separable convs expected, weights have {}",
                    i,
                    block.convs.len(),
                    saved.convs.len()
                );
            }
        }
        Ok(())
    }

    /// 事前学習済み重みを読み込む（形式は拡張子で判定）
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("backbone weights not found: {}", path.display());
        }
        let loaded = match path.extension().and_then(|e| e.to_str()) {
            Some("mpk") => self.load_record_file(path, device),
            Some("pth") | Some("pt") | Some("safetensors") => self.load_timm(path),
            _ => anyhow::bail!(
                "unsupported backbone weights format: {} (expected .mpk, .pth, .pt or .safetensors)",
                path.display()
            ),
        };
        loaded.with_context(|| format!("Failed to load backbone weights: {}", path.display()))
    }

    fn load_record_file(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        let record: XceptionRecord<B> =
            <DefaultFileRecorder<FullPrecisionSettings> as Recorder<B>>::load(&recorder, path.to_path_buf(), device)
                .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        self.ensure_record_layout(&record)?;

        let expected = parameter_shapes::<B, _>(&self);
        let loaded = self.load_record(record);
        ensure_same_shapes(&expected, &parameter_shapes::<B, _>(&loaded))?;
        Ok(loaded)
    }

    /// timmのstate_dictを読み込む（分類層 `fc.*` と `num_batches_tracked` は使わない）
    fn load_timm(mut self, path: &Path) -> Result<Self> {
        let middle = self.middle_blocks();
        if middle > TIMM_MIDDLE_BLOCKS {
            anyhow::bail!(
                "timm Xception weights have {} middle blocks, backbone is configured with {}",
                TIMM_MIDDLE_BLOCKS,
                middle
            );
        }
        let remapper = timm_remapper(middle)?;

        let is_safetensors = path.extension().and_then(|e| e.to_str()) == Some("safetensors");
        let result = if is_safetensors {
            let mut store = SafetensorsStore::from_file(path)
                .with_from_adapter(burn_store::PyTorchToBurnAdapter)
                .remap(remapper)
                .allow_partial(false);
            self.load_from(&mut store).map_err(|e| anyhow::anyhow!("{}", e))?
        } else {
            let mut store = PytorchStore::from_file(path).remap(remapper).allow_partial(false);
            self.load_from(&mut store).map_err(|e| anyhow::anyhow!("{}", e))?
        };

        tracing::debug!(
            "timm重みを適用しました: {} テンソル (未使用 {})",
            result.applied.len(),
            result.unused.len()
        );
        Ok(self)
    }

    /// 重みをburnのNamedMpkレコードとして保存する（拡張子は `.mpk` に揃える）
    pub fn save_record_file(self, path: &Path) -> Result<std::path::PathBuf> {
        let record_path = path.with_extension("mpk");
        if let Some(parent) = record_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        self.save_file(
            record_path.clone(),
            &DefaultFileRecorder::<FullPrecisionSettings>::new(),
        )
        .map_err(|e| anyhow::anyhow!("{:?}", e))
        .with_context(|| format!("Failed to save backbone weights: {}", record_path.display()))?;
        Ok(record_path)
    }
}

/// timm `legacy_xception` のキー接頭辞とこのモジュールのパスの対応
///
/// middle flowは timm の block4 から順に `middle_blocks` 個、exit flowの残差ブロックは常に block12。
/// entry flowの block1 は先頭のReLUが無いため `rep` の添字が1つずれます。
pub fn timm_key_prefixes(middle_blocks: usize) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = [
        ("conv1.", "stem1.conv."),
        ("bn1.", "stem1.bn."),
        ("conv2.", "stem2.conv."),
        ("bn2.", "stem2.bn."),
        ("conv3.conv1.", "exit_conv1.depthwise."),
        ("conv3.pointwise.", "exit_conv1.pointwise."),
        ("bn3.", "exit_conv1.bn."),
        ("conv4.conv1.", "exit_conv2.depthwise."),
        ("conv4.pointwise.", "exit_conv2.pointwise."),
        ("bn4.", "exit_conv2.bn."),
    ]
    .iter()
    .map(|(from, to)| (from.to_string(), to.to_string()))
    .collect();

    // (timmのブロック番号, blocksの添字, SepConv数, 縮小ブロックか)
    let mut blocks = vec![(1, 0, 2, true), (2, 1, 2, true), (3, 2, 2, true)];
    blocks.extend((0..middle_blocks).map(|i| (4 + i, 3 + i, 3, false)));
    blocks.push((12, 3 + middle_blocks, 2, true));

    for (timm, index, depth, downsample) in blocks {
        // rep = [ReLU, SepConv, BN] の繰り返し（block1のみ先頭ReLUなし）
        let offset = if timm == 1 { 0 } else { 1 };
        for j in 0..depth {
            let rep = offset + 3 * j;
            let target = format!("blocks.{index}.convs.{j}.");
            pairs.push((format!("block{timm}.rep.{rep}.conv1."), format!("{target}depthwise.")));
            pairs.push((format!("block{timm}.rep.{rep}.pointwise."), format!("{target}pointwise.")));
            pairs.push((format!("block{timm}.rep.{}.", rep + 1), format!("{target}bn.")));
        }
        if downsample {
            pairs.push((format!("block{timm}.skip."), format!("blocks.{index}.shortcut.conv.")));
            pairs.push((format!("block{timm}.skipbn."), format!("blocks.{index}.shortcut.bn.")));
        }
    }
    pairs
}

fn timm_remapper(middle_blocks: usize) -> Result<KeyRemapper> {
    let patterns = timm_key_prefixes(middle_blocks)
        .into_iter()
        .map(|(from, to)| (format!("^{}", from.replace('.', r"\.")), to));
    Ok(KeyRemapper::from_pattern_iter(patterns)?)
}

/// 空間方向の平均 [b, c, h, w] → [b, c]
pub fn global_average_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch_size, channels, _, _] = x.dims();
    x.mean_dim(3).mean_dim(2).reshape([batch_size, channels])
}
