//! Image decoding.
//!
//! Every referenced image is decoded once, resized to the configured size
//! without preserving the aspect ratio, converted to RGB, scaled to `[0, 1]`
//! and stored channel-first in one contiguous buffer.

use std::path::Path;

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use memesense_core::config::{DataConfig, ImageConfig, MissingImagePolicy, ResizeFilter};
use memesense_core::{MemeSenseError, Result, Sample};
use tracing::{info, warn};

/// Number of colour channels in every stored image.
pub const CHANNELS: usize = 3;

const PROGRESS_EVERY: usize = 1000;

/// Decoded images, `len × 3 × height × width`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSet {
    /// Pixel values in `[0, 1]`, CHW per image.
    pub data: Vec<f32>,
    /// Number of images.
    pub len: usize,
    /// Image height in pixels.
    pub height: usize,
    /// Image width in pixels.
    pub width: usize,
}

impl ImageSet {
    /// An empty set of `height × width` images.
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            data: Vec::new(),
            len: 0,
            height,
            width,
        }
    }

    /// Values per image (`3 × height × width`).
    pub fn image_len(&self) -> usize {
        CHANNELS * self.height * self.width
    }

    /// Whether the set holds no images.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CHW values of image `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len`.
    pub fn image(&self, index: usize) -> &[f32] {
        let n = self.image_len();
        &self.data[index * n..(index + 1) * n]
    }

    /// Append one CHW image.
    ///
    /// # Errors
    ///
    /// Returns [`MemeSenseError::Image`] if `pixels` has the wrong length.
    pub fn push(&mut self, pixels: &[f32]) -> Result<()> {
        if pixels.len() != self.image_len() {
            return Err(MemeSenseError::Image(format!(
                "expected {} values per image, got {}",
                self.image_len(),
                pixels.len()
            )));
        }
        self.data.extend_from_slice(pixels);
        self.len += 1;
        Ok(())
    }

    /// New set holding the images at `indices`, in that order.
    ///
    /// # Panics
    ///
    /// Panics if any index is out of range.
    pub fn gather(&self, indices: &[usize]) -> ImageSet {
        let mut data = Vec::with_capacity(indices.len() * self.image_len());
        for &i in indices {
            data.extend_from_slice(self.image(i));
        }
        ImageSet {
            data,
            len: indices.len(),
            height: self.height,
            width: self.width,
        }
    }

    /// Render image `index` back to 8-bit RGB.
    pub fn to_rgb_image(&self, index: usize) -> RgbImage {
        let pixels = self.image(index);
        let plane = self.height * self.width;
        let width = self.width;
        RgbImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let offset = y as usize * width + x as usize;
            let channel =
                |c: usize| (pixels[c * plane + offset].clamp(0.0, 1.0) * 255.0).round() as u8;
            Rgb([channel(0), channel(1), channel(2)])
        })
    }
}

/// Images decoded for a sample table.
#[derive(Debug, Clone)]
pub struct LoadedImages {
    /// One image per kept sample.
    pub images: ImageSet,
    /// Indices into the input samples that were kept, ascending.
    pub kept: Vec<usize>,
}

/// Decode the image of every sample, resolved against `data.images_dir`.
///
/// # Errors
///
/// With [`MissingImagePolicy::Abort`], the first unreadable image fails the
/// load with [`MemeSenseError::Image`] naming the file. With
/// [`MissingImagePolicy::Skip`] the sample is dropped and a warning logged.
pub fn load_images(
    samples: &[Sample],
    data: &DataConfig,
    image: &ImageConfig,
) -> Result<LoadedImages> {
    let mut images = ImageSet::new(image.height as usize, image.width as usize);
    images.data.reserve(samples.len() * images.image_len());
    let mut kept = Vec::with_capacity(samples.len());
    let mut skipped = 0usize;

    for (i, sample) in samples.iter().enumerate() {
        let path = data.images_dir.join(&sample.image_path);
        match decode_image(&path, image) {
            Ok(pixels) => {
                images.push(&pixels)?;
                kept.push(i);
            }
            Err(e) => match data.on_missing_image {
                MissingImagePolicy::Abort => return Err(e),
                MissingImagePolicy::Skip => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable image");
                    skipped += 1;
                }
            },
        }
        if (i + 1) % PROGRESS_EVERY == 0 {
            info!(processed = i + 1, total = samples.len(), "Decoding images");
        }
    }

    info!(
        loaded = images.len,
        skipped,
        height = images.height,
        width = images.width,
        "Decoded images"
    );
    Ok(LoadedImages { images, kept })
}

/// Decode one image file into CHW values in `[0, 1]`.
///
/// # Errors
///
/// Returns [`MemeSenseError::Image`] if the file is missing or undecodable.
pub fn decode_image(path: &Path, config: &ImageConfig) -> Result<Vec<f32>> {
    let img = image::open(path).map_err(|e| {
        MemeSenseError::Image(format!("Failed to read image {}: {}", path.display(), e))
    })?;
    let rgb = img
        .resize_exact(config.width, config.height, filter_type(config.resize_filter))
        .to_rgb8();
    Ok(rgb_to_chw(&rgb))
}

/// Convert an RGB image to CHW values in `[0, 1]`.
pub fn rgb_to_chw(rgb: &RgbImage) -> Vec<f32> {
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let plane = w * h;
    let mut out = vec![0f32; CHANNELS * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * w + x as usize;
        for c in 0..CHANNELS {
            out[c * plane + offset] = f32::from(pixel.0[c]) / 255.0;
        }
    }
    out
}

fn filter_type(filter: ResizeFilter) -> FilterType {
    match filter {
        ResizeFilter::Nearest => FilterType::Nearest,
        ResizeFilter::Triangle => FilterType::Triangle,
        ResizeFilter::CatmullRom => FilterType::CatmullRom,
        ResizeFilter::Lanczos3 => FilterType::Lanczos3,
    }
}
