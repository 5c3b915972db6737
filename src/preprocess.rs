//! Image preprocessing: decode, aspect-preserving bilinear resize, batch axis.

use std::path::PathBuf;

use image::{DynamicImage, RgbImage};
use ndarray::{Array3, Axis};
use tracing::debug;

use crate::error::{DroneAidError, Result};
use crate::types::{InputTensor, DEFAULT_MAX_SIZE};

/// Where the pixels come from.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Encoded image file on disk (PNG or JPEG).
    Path(PathBuf),
    /// Encoded image held in memory.
    Encoded(Vec<u8>),
    /// Already decoded pixels.
    Decoded(DynamicImage),
}

impl ImageInput {
    fn decode(self) -> Result<RgbImage> {
        let image = match self {
            ImageInput::Path(path) => image::open(&path)
                .map_err(|e| DroneAidError::Decode(format!("{}: {}", path.display(), e)))?,
            ImageInput::Encoded(bytes) => image::load_from_memory(&bytes)?,
            ImageInput::Decoded(image) => image,
        };
        Ok(image.into_rgb8())
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        ImageInput::Path(path)
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        ImageInput::Decoded(image)
    }
}

impl From<RgbImage> for ImageInput {
    fn from(image: RgbImage) -> Self {
        ImageInput::Decoded(DynamicImage::ImageRgb8(image))
    }
}

/// Target `(width, height)` whose longer side is `max_size`.
///
/// Both sides are scaled by `max_size / max(width, height)` and rounded; a
/// side that would round to zero is kept at one pixel. A `max_size` of zero
/// is rejected.
pub fn compute_target_size(width: u32, height: u32, max_size: u32) -> Result<(u32, u32)> {
    if max_size == 0 {
        return Err(DroneAidError::InvalidOption {
            field: "max_size",
            value: max_size.to_string(),
        });
    }
    if width == 0 || height == 0 {
        return Err(DroneAidError::Decode(format!(
            "image has no pixels: {}x{}",
            width, height
        )));
    }
    let ratio = f64::from(max_size) / f64::from(width.max(height));
    let target_width = (ratio * f64::from(width)).round() as u32;
    let target_height = (ratio * f64::from(height)).round() as u32;
    Ok((target_width.max(1), target_height.max(1)))
}

/// Turns images into the `[1, H, W, 3]` tensor the detection model expects.
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    max_size: u32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl Preprocessor {
    pub fn new(max_size: u32) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Decodes and resizes on the blocking pool. Fails with
    /// [`DroneAidError::Decode`] when the image cannot be read.
    pub async fn preprocess(&self, image: ImageInput) -> Result<InputTensor> {
        let max_size = self.max_size;
        tokio::task::spawn_blocking(move || {
            let rgb = image.decode()?;
            image_to_tensor(&rgb, max_size)
        })
        .await?
    }
}

fn image_to_tensor(rgb: &RgbImage, max_size: u32) -> Result<InputTensor> {
    let (width, height) = rgb.dimensions();
    let (target_width, target_height) = compute_target_size(width, height, max_size)?;
    debug!(
        "resize {}x{} -> {}x{}",
        width, height, target_width, target_height
    );

    Ok(resize_bilinear(rgb, target_width, target_height).insert_axis(Axis(0)))
}

/// Source taps for one output coordinate: lower index, upper index, weight
/// of the upper one.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tap {
    lo: u32,
    hi: u32,
    frac: f32,
}

/// Taps along one axis. Output `i` samples source position `i * in / out`
/// (corners not aligned, no half-pixel offset); the upper tap is clamped to
/// the last source index.
fn axis_taps(in_len: u32, out_len: u32) -> Vec<Tap> {
    let scale = in_len as f32 / out_len as f32;
    let last = in_len - 1;
    (0..out_len)
        .map(|i| {
            let src = i as f32 * scale;
            let lo = (src.floor() as u32).min(last);
            Tap {
                lo,
                hi: (lo + 1).min(last),
                frac: src - lo as f32,
            }
        })
        .collect()
}

/// Point-sampled bilinear resize into an `[H, W, 3]` float array.
///
/// Values stay unrounded `f32` intensities in `0..=255`.
fn resize_bilinear(rgb: &RgbImage, target_width: u32, target_height: u32) -> Array3<f32> {
    let (width, height) = rgb.dimensions();
    let xs = axis_taps(width, target_width);
    let ys = axis_taps(height, target_height);
    let at = |x: u32, y: u32, c: usize| f32::from(rgb.get_pixel(x, y)[c]);

    Array3::from_shape_fn(
        (target_height as usize, target_width as usize, 3),
        |(y, x, c)| {
            let (ty, tx) = (ys[y], xs[x]);
            let top_left = at(tx.lo, ty.lo, c);
            let top_right = at(tx.hi, ty.lo, c);
            let bottom_left = at(tx.lo, ty.hi, c);
            let bottom_right = at(tx.hi, ty.hi, c);

            let top = top_left + (top_right - top_left) * tx.frac;
            let bottom = bottom_left + (bottom_right - bottom_left) * tx.frac;
            top + (bottom - top) * ty.frac
        },
    )
}
