//! ランダム幾何変換（回転・シフト・ズーム・左右反転）
//!
//! 出力画素ごとに逆変換で元画像の座標を求め、最近傍でサンプリングします。
//! 画像外の座標は端の画素で埋めます（nearest fill）。

use anyhow::{ensure, Result};
use image::{Rgb, RgbImage};
use rand::Rng;

use crate::model::config::AugmentSettings;

/// 1回分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    /// 回転角（度）
    pub angle_deg: f32,
    /// 水平シフト（ピクセル）
    pub tx: f32,
    /// 垂直シフト（ピクセル）
    pub ty: f32,
    /// 水平ズーム係数（1未満で拡大）
    pub zoom_x: f32,
    /// 垂直ズーム係数
    pub zoom_y: f32,
    /// 左右反転
    pub flip: bool,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            angle_deg: 0.0,
            tx: 0.0,
            ty: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip: false,
        }
    }
}

/// 設定範囲からパラメータをサンプリングして画像に適用する変換
#[derive(Debug, Clone)]
pub struct RandomAffine {
    settings: AugmentSettings,
}

impl RandomAffine {
    pub fn new(settings: AugmentSettings) -> Result<Self> {
        ensure!(
            settings.rotation_range >= 0.0,
            "rotation_range must be non-negative (got {})",
            settings.rotation_range
        );
        ensure!(
            (0.0..1.0).contains(&settings.width_shift_range)
                && (0.0..1.0).contains(&settings.height_shift_range),
            "shift ranges must be in [0, 1) (got {}, {})",
            settings.width_shift_range,
            settings.height_shift_range
        );
        ensure!(
            (0.0..1.0).contains(&settings.zoom_range),
            "zoom_range must be in [0, 1) (got {})",
            settings.zoom_range
        );
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &AugmentSettings {
        &self.settings
    }

    /// 画像サイズに応じたパラメータをサンプリング
    pub fn sample<R: Rng>(&self, rng: &mut R, width: u32, height: u32) -> AffineParams {
        let s = &self.settings;
        let symmetric = |rng: &mut R, range: f32| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };

        let angle_deg = symmetric(rng, s.rotation_range);
        let tx = symmetric(rng, s.width_shift_range) * width as f32;
        let ty = symmetric(rng, s.height_shift_range) * height as f32;
        let (zoom_x, zoom_y) = if s.zoom_range > 0.0 {
            let lo = 1.0 - s.zoom_range;
            let hi = 1.0 + s.zoom_range;
            (rng.gen_range(lo..=hi), rng.gen_range(lo..=hi))
        } else {
            (1.0, 1.0)
        };
        let flip = s.horizontal_flip && rng.gen_bool(0.5);

        AffineParams {
            angle_deg,
            tx,
            ty,
            zoom_x,
            zoom_y,
            flip,
        }
    }

    /// ランダムな変換を適用した新しい画像を返す
    pub fn apply<R: Rng>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let params = self.sample(rng, img.width(), img.height());
        warp(img, &params)
    }
}

/// 与えられたパラメータで画像を変換（出力サイズは入力と同じ）
pub fn warp(img: &RgbImage, params: &AffineParams) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }

    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let theta = params.angle_deg.to_radians();
    let (sin, cos) = theta.sin_cos();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    let mut out = RgbImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let ox = if params.flip { max_x - x as f32 } else { x as f32 };
            let dx = ox - cx;
            let dy = y as f32 - cy;

            // 出力座標 → 入力座標
            let rx = cos * dx - sin * dy;
            let ry = sin * dx + cos * dy;
            let sx = (rx * params.zoom_x + cx + params.tx).round().clamp(0.0, max_x);
            let sy = (ry * params.zoom_y + cy + params.ty).round().clamp(0.0, max_y);

            let pixel: Rgb<u8> = *img.get_pixel(sx as u32, sy as u32);
            out.put_pixel(x, y, pixel);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
        })
    }

    #[test]
    fn test_identity_warp() {
        let img = gradient(17, 11);
        let out = warp(&img, &AffineParams::identity());
        assert_eq!(out, img);
    }

    #[test]
    fn test_flip_only() {
        let img = gradient(8, 4);
        let params = AffineParams {
            flip: true,
            ..AffineParams::identity()
        };
        let out = warp(&img, &params);
        for y in 0..4 {
            for x in 0..8 {
                assert_eq!(out.get_pixel(x, y), img.get_pixel(7 - x, y));
            }
        }
    }

    #[test]
    fn test_shift_fills_with_edge() {
        let img = gradient(10, 10);
        let params = AffineParams {
            tx: 3.0,
            ..AffineParams::identity()
        };
        let out = warp(&img, &params);
        // 右端3列は元画像の右端列で埋まる
        for y in 0..10 {
            assert_eq!(out.get_pixel(9, y), img.get_pixel(9, y));
            assert_eq!(out.get_pixel(7, y), img.get_pixel(9, y));
            assert_eq!(out.get_pixel(0, y), img.get_pixel(3, y));
        }
    }

    #[test]
    fn test_sample_within_ranges() {
        let aug = RandomAffine::new(AugmentSettings::balancing()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let p = aug.sample(&mut rng, 100, 50);
            assert!(p.angle_deg.abs() <= 20.0);
            assert!(p.tx.abs() <= 10.0 + 1e-4);
            assert!(p.ty.abs() <= 5.0 + 1e-4);
            assert!((0.8999..=1.1001).contains(&p.zoom_x));
            assert!((0.8999..=1.1001).contains(&p.zoom_y));
        }
    }

    #[test]
    fn test_same_seed_same_output() {
        let aug = RandomAffine::new(AugmentSettings::training()).unwrap();
        let img = gradient(24, 24);
        let a = aug.apply(&img, &mut StdRng::seed_from_u64(42));
        let b = aug.apply(&img, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
        assert_eq!(a.dimensions(), (24, 24));
    }

    #[test]
    fn test_rejects_invalid_zoom() {
        let mut settings = AugmentSettings::training();
        settings.zoom_range = 1.5;
        assert!(RandomAffine::new(settings).is_err());
    }
}
