//! Training-time image augmentation.
//!
//! Random horizontal flip followed by a random rotation about the image
//! centre. Rotation samples bilinearly and fills from a mirror reflection of
//! the image, edge pixel included (`d c b a | a b c d | d c b a`).

use std::f64::consts::TAU;

use memesense_core::config::ImageConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::images::{ImageSet, CHANNELS};

/// Seeded random flip + rotation.
#[derive(Debug, Clone)]
pub struct ImageAugmenter {
    flip_probability: f64,
    max_angle: f64,
    rng: ChaCha8Rng,
}

impl ImageAugmenter {
    pub fn new(config: &ImageConfig, seed: u64) -> Self {
        Self {
            flip_probability: config.flip_probability,
            max_angle: config.rotation_factor * TAU,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Augment one CHW image in place.
    pub fn augment(&mut self, chw: &mut [f32], height: usize, width: usize) {
        if self.rng.gen_bool(self.flip_probability) {
            flip_horizontal(chw, height, width);
        }
        let angle = self.rng.gen_range(-self.max_angle..=self.max_angle);
        if angle != 0.0 {
            let rotated = rotate(chw, height, width, angle);
            chw.copy_from_slice(&rotated);
        }
    }

    /// Augment every image of `images` in place.
    pub fn augment_set(&mut self, images: &mut ImageSet) {
        let n = images.image_len();
        let (h, w) = (images.height, images.width);
        for chunk in images.data.chunks_exact_mut(n) {
            self.augment(chunk, h, w);
        }
    }
}

/// Mirror a CHW image left to right.
pub fn flip_horizontal(chw: &mut [f32], height: usize, width: usize) {
    for row in chw.chunks_exact_mut(width).take(CHANNELS * height) {
        row.reverse();
    }
}

/// Rotate a CHW image by `angle` radians about its centre.
pub fn rotate(chw: &[f32], height: usize, width: usize, angle: f64) -> Vec<f32> {
    let (sin, cos) = angle.sin_cos();
    let cx = (width as f64 - 1.0) / 2.0;
    let cy = (height as f64 - 1.0) / 2.0;
    let plane = height * width;
    let mut out = vec![0f32; chw.len()];

    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            // inverse mapping: where this output pixel comes from
            let sx = cos * dx + sin * dy + cx;
            let sy = -sin * dx + cos * dy + cy;

            let x0 = sx.floor();
            let y0 = sy.floor();
            let fx = (sx - x0) as f32;
            let fy = (sy - y0) as f32;
            let (x0, y0) = (x0 as i64, y0 as i64);
            let xa = reflect(x0, width);
            let xb = reflect(x0 + 1, width);
            let ya = reflect(y0, height);
            let yb = reflect(y0 + 1, height);

            for c in 0..CHANNELS {
                let p = &chw[c * plane..(c + 1) * plane];
                let top = p[ya * width + xa] * (1.0 - fx) + p[ya * width + xb] * fx;
                let bottom = p[yb * width + xa] * (1.0 - fx) + p[yb * width + xb] * fx;
                out[c * plane + y * width + x] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

/// Map an out-of-range coordinate into `0..n` by mirror reflection.
fn reflect(i: i64, n: usize) -> usize {
    let n = n as i64;
    let m = i.rem_euclid(2 * n);
    (if m < n { m } else { 2 * n - 1 - m }) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    // 3 channels of a 2x3 image, values encode (channel, row, col)
    fn sample_image() -> Vec<f32> {
        let mut v = Vec::new();
        for c in 0..3 {
            for y in 0..2 {
                for x in 0..3 {
                    v.push((c * 100 + y * 10 + x) as f32);
                }
            }
        }
        v
    }

    fn config(flip: f64, rotation: f64) -> ImageConfig {
        ImageConfig {
            flip_probability: flip,
            rotation_factor: rotation,
            ..ImageConfig::default()
        }
    }

    #[test]
    fn test_reflect_is_symmetric_about_edges() {
        let got: Vec<usize> = (-4..8).map(|i| reflect(i, 4)).collect();
        assert_eq!(got, vec![3, 2, 1, 0, 0, 1, 2, 3, 3, 2, 1, 0]);
    }

    #[test]
    fn test_flip_horizontal() {
        let mut img = sample_image();
        flip_horizontal(&mut img, 2, 3);
        assert_eq!(&img[..6], &[2.0, 1.0, 0.0, 12.0, 11.0, 10.0]);
        assert_eq!(&img[12..15], &[202.0, 201.0, 200.0]);
    }

    #[test]
    fn test_zero_rotation_is_identity() {
        let img = sample_image();
        assert_eq!(rotate(&img, 2, 3, 0.0), img);
    }

    #[test]
    fn test_half_turn_matches_double_flip() {
        let img = sample_image();
        let rotated = rotate(&img, 2, 3, PI);
        let mut expected = Vec::new();
        for c in 0..3 {
            for y in (0..2).rev() {
                for x in (0..3).rev() {
                    expected.push((c * 100 + y * 10 + x) as f32);
                }
            }
        }
        for (a, b) in rotated.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_certain_flip_without_rotation() {
        let mut aug = ImageAugmenter::new(&config(1.0, 0.0), 42);
        let mut img = sample_image();
        let mut expected = sample_image();
        flip_horizontal(&mut expected, 2, 3);
        aug.augment(&mut img, 2, 3);
        assert_eq!(img, expected);
    }

    #[test]
    fn test_disabled_augmentation_is_identity() {
        let mut aug = ImageAugmenter::new(&config(0.0, 0.0), 42);
        let mut img = sample_image();
        aug.augment(&mut img, 2, 3);
        assert_eq!(img, sample_image());
    }

    #[test]
    fn test_same_seed_same_augmentation() {
        let mut set = ImageSet::new(2, 3);
        set.push(&sample_image()).unwrap();
        set.push(&sample_image()).unwrap();
        let mut a = set.clone();
        let mut b = set.clone();
        ImageAugmenter::new(&config(0.5, 0.2), 9).augment_set(&mut a);
        ImageAugmenter::new(&config(0.5, 0.2), 9).augment_set(&mut b);
        assert_eq!(a, b);
        assert_eq!(a.data.len(), set.data.len());
    }

    #[test]
    fn test_rotation_stays_within_value_range() {
        let mut aug = ImageAugmenter::new(&config(0.5, 0.2), 3);
        let mut img: Vec<f32> = (0..3 * 8 * 8).map(|i| (i % 7) as f32 / 6.0).collect();
        for _ in 0..10 {
            aug.augment(&mut img, 8, 8);
            assert!(img.iter().all(|&v| (-1e-6..=1.0 + 1e-6).contains(&v)));
        }
    }
}
