//! Per-sample transforms: augmentation on stored `u8` images and normalization
//! into channel-first `f32` rows.

use crate::data::container::ImageShape;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Zero padding added on each side before a random crop.
pub const CROP_PADDING: u32 = 8;

/// Per-channel normalization statistics, computed offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    /// Scale a channel-last `u8` image to `[0, 1]`, normalize it and write it
    /// channel-first into `out`.
    pub fn apply(&self, image: &[u8], shape: ImageShape, out: &mut [f32]) {
        let (h, w, c) = (
            shape.height as usize,
            shape.width as usize,
            shape.channels as usize,
        );
        let plane = h * w;
        for (pixel, values) in image.chunks_exact(c).enumerate() {
            for (channel, &value) in values.iter().enumerate() {
                let scaled = f32::from(value) / 255.0;
                out[channel * plane + pixel] = (scaled - self.mean[channel]) / self.std[channel];
            }
        }
    }
}

/// Crop back to the original size after zero-padding every side by `padding`.
pub fn random_crop<R: Rng + ?Sized>(
    image: &[u8],
    shape: ImageShape,
    padding: u32,
    rng: &mut R,
) -> Vec<u8> {
    let (h, w, c) = (
        shape.height as i64,
        shape.width as i64,
        shape.channels as usize,
    );
    let pad = i64::from(padding);
    let dy = rng.gen_range(0..=2 * pad) - pad;
    let dx = rng.gen_range(0..=2 * pad) - pad;

    let mut out = vec![0u8; image.len()];
    for y in 0..h {
        let sy = y + dy;
        if sy < 0 || sy >= h {
            continue;
        }
        for x in 0..w {
            let sx = x + dx;
            if sx < 0 || sx >= w {
                continue;
            }
            let dst = ((y * w + x) as usize) * c;
            let src = ((sy * w + sx) as usize) * c;
            out[dst..dst + c].copy_from_slice(&image[src..src + c]);
        }
    }
    out
}

/// Mirror a channel-last image left to right, in place.
pub fn flip_horizontal(image: &mut [u8], shape: ImageShape) {
    let (w, c) = (shape.width as usize, shape.channels as usize);
    for row in image.chunks_exact_mut(w * c) {
        for x in 0..w / 2 {
            let (left, right) = (x * c, (w - 1 - x) * c);
            for k in 0..c {
                row.swap(left + k, right + k);
            }
        }
    }
}

/// Training augmentation: padded random crop, then a coin-flip mirror.
pub fn augment<R: Rng + ?Sized>(image: &[u8], shape: ImageShape, rng: &mut R) -> Vec<u8> {
    let mut out = random_crop(image, shape, CROP_PADDING, rng);
    if rng.gen_bool(0.5) {
        flip_horizontal(&mut out, shape);
    }
    out
}
