//! 重みとモデル構成の整合性チェック
//!
//! burnの `load_record` はテンソル形状を確認しないため、読み込み前後で
//! パラメータ形状の並びを比較して、構成と合わない重みをエラーにします。

use anyhow::Result;
use burn::{
    module::{Module, ModuleVisitor, Param},
    tensor::{backend::Backend, Tensor},
};

struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        // 未初期化のパラメータを確保しない
        self.shapes.push(param.lazy_shape().dims);
    }
}

/// 浮動小数パラメータの形状を訪問順に並べる（BatchNormの移動統計を含む）
pub fn parameter_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut collector = ShapeCollector { shapes: Vec::new() };
    module.visit(&mut collector);
    collector.shapes
}

/// 形状の並びが一致しなければエラー
pub fn ensure_same_shapes(expected: &[Vec<usize>], found: &[Vec<usize>]) -> Result<()> {
    if expected.len() != found.len() {
        anyhow::bail!(
            "parameter count mismatch: model config has {} tensors, weights have {}",
            expected.len(),
            found.len()
        );
    }
    if let Some((index, (e, f))) = expected
        .iter()
        .zip(found)
        .enumerate()
        .find(|(_, (e, f))| e != f)
    {
        anyhow::bail!(
            "parameter #{} shape mismatch: model config expects {:?}, weights have {:?}",
            index,
            e,
            f
        );
    }
    Ok(())
}
