//! Frame preprocessing ahead of detection.
//!
//! Every sampled frame is sharpened with an unsharp mask, then either resized
//! to the detector's square input or upscaled by a linear factor. `prepare` returns
//! the processed frame together with the `CoordinateTransform` that maps boxes
//! found in it back onto the decoded frame.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::detect::BBox;
use crate::frame::Frame;

/// Gaussian sigma of the unsharp-mask blur.
const SHARPEN_SIGMA: f32 = 3.0;
/// Weight of the original image in the unsharp mask.
const SHARPEN_ORIGINAL_WEIGHT: f32 = 1.5;
/// Weight of the blurred image in the unsharp mask.
const SHARPEN_BLUR_WEIGHT: f32 = -0.5;
/// Largest frame `prepare` will produce (64 MP).
pub const MAX_PREPARED_PIXELS: u64 = 8192 * 8192;

/// Resizing controls for `prepare`. The two knobs are independent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrepareOptions {
    /// Square resolution the detector expects, if any.
    pub target_size: Option<u32>,
    /// Linear upscale applied after sharpening; 1.0 disables it. Ignored
    /// when `target_size` is set.
    pub upscale_factor: f32,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            target_size: None,
            upscale_factor: 1.0,
        }
    }
}

/// Maps boxes between the processed frame and the original frame.
///
/// `processed = original * scale` per axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordinateTransform {
    pub scale_x: f32,
    pub scale_y: f32,
}

impl CoordinateTransform {
    pub fn identity() -> Self {
        Self {
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }

    pub fn uniform(scale: f32) -> Self {
        Self {
            scale_x: scale,
            scale_y: scale,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.scale_x == 1.0 && self.scale_y == 1.0
    }

    /// Map a box found in the processed frame back to original coordinates.
    pub fn to_original(&self, bbox: BBox) -> BBox {
        BBox {
            x1: bbox.x1 / self.scale_x,
            y1: bbox.y1 / self.scale_y,
            x2: bbox.x2 / self.scale_x,
            y2: bbox.y2 / self.scale_y,
        }
    }

    /// Map an original-frame box into processed coordinates.
    pub fn to_processed(&self, bbox: BBox) -> BBox {
        BBox {
            x1: bbox.x1 * self.scale_x,
            y1: bbox.y1 * self.scale_y,
            x2: bbox.x2 * self.scale_x,
            y2: bbox.y2 * self.scale_y,
        }
    }
}

/// Sharpen, then rescale, a frame for detection.
///
/// A square `target_size` replaces the upscale step: the frame is resized
/// straight from its decoded size, since an intermediate upscale would be
/// resampled away. Output larger than `MAX_PREPARED_PIXELS` is rejected.
pub fn prepare(frame: &Frame, options: &PrepareOptions) -> Result<(Frame, CoordinateTransform)> {
    if !(options.upscale_factor > 0.0 && options.upscale_factor.is_finite()) {
        return Err(anyhow!(
            "upscale factor must be a positive number, got {}",
            options.upscale_factor
        ));
    }
    if options.target_size == Some(0) {
        return Err(anyhow!("target size must be non-zero"));
    }

    let (w, h, transform) = match options.target_size {
        Some(size) => (
            size,
            size,
            CoordinateTransform {
                scale_x: size as f32 / frame.width as f32,
                scale_y: size as f32 / frame.height as f32,
            },
        ),
        None if options.upscale_factor != 1.0 => (
            scaled_dim(frame.width, options.upscale_factor)?,
            scaled_dim(frame.height, options.upscale_factor)?,
            CoordinateTransform::uniform(options.upscale_factor),
        ),
        None => (frame.width, frame.height, CoordinateTransform::identity()),
    };
    check_pixel_budget(w, h)?;

    let original = frame.to_image()?;
    let mut processed = sharpen(&original);
    if processed.dimensions() != (w, h) {
        processed = imageops::resize(&processed, w, h, FilterType::Triangle);
    }

    Ok((Frame::from_image(processed, frame.index), transform))
}

fn check_pixel_budget(width: u32, height: u32) -> Result<()> {
    match (width as u64).checked_mul(height as u64) {
        Some(pixels) if pixels <= MAX_PREPARED_PIXELS => Ok(()),
        _ => Err(anyhow!(
            "prepared frame {width}x{height} exceeds the {MAX_PREPARED_PIXELS} pixel limit"
        )),
    }
}

/// Unsharp mask: `1.5 * original - 0.5 * gaussian(original)`, clipped to u8.
pub fn sharpen(image: &RgbImage) -> RgbImage {
    let blurred = imageops::blur(image, SHARPEN_SIGMA);
    let mut out = RgbImage::new(image.width(), image.height());
    for ((dst, src), blur) in out
        .pixels_mut()
        .zip(image.pixels())
        .zip(blurred.pixels())
    {
        for c in 0..3 {
            let v = SHARPEN_ORIGINAL_WEIGHT * src[c] as f32 + SHARPEN_BLUR_WEIGHT * blur[c] as f32;
            dst[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

fn scaled_dim(dim: u32, factor: f32) -> Result<u32> {
    let scaled = (dim as f64 * factor as f64).round();
    if scaled > u32::MAX as f64 {
        return Err(anyhow!("upscaling {dim} px by {factor} overflows"));
    }
    Ok((scaled as u32).max(1))
}
