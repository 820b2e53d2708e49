//! Decoded raster frames.
//!
//! A `Frame` is owned by the sampler for exactly one iteration. Sources hand
//! frames over by value; the preprocessor and renderer borrow them. Pixel bytes
//! are packed RGB24, row-major, with no stride padding.

use anyhow::{anyhow, Result};
use image::RgbImage;

/// Bytes per pixel for packed RGB24.
pub const RGB_CHANNELS: usize = 3;

/// A single decoded frame.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1-based position of this frame in its source stream.
    pub index: u64,
}

impl Frame {
    /// Create a frame, checking that the buffer matches the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {}: expected {} RGB bytes for {}x{}, received {}",
                index,
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            index,
        })
    }

    /// Solid-colour frame, mostly useful for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, index: u64, rgb: [u8; 3]) -> Result<Self> {
        let len = expected_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..(len / RGB_CHANNELS) {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height, index)
    }

    pub fn from_image(image: RgbImage, index: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            index,
        }
    }

    /// Read-only pixel access for detectors and renderers.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame {} buffer does not match its dimensions", self.index))
    }

    pub fn into_image(self) -> Result<RgbImage> {
        let index = self.index;
        RgbImage::from_raw(self.width, self.height, self.data)
            .ok_or_else(|| anyhow!("frame {} buffer does not match its dimensions", index))
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame dimensions must be non-zero"));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
