//! Still image source: one decoded frame, then exhausted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::FrameSource;
use crate::frame::Frame;

/// Extensions decoded as still images rather than video.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}

pub struct StillImageSource {
    path: PathBuf,
    frame: Option<Frame>,
}

impl StillImageSource {
    /// Decode the image eagerly so open failures surface before sampling.
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?
            .into_rgb8();
        log::info!(
            "StillImageSource: opened {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(Self {
            path: path.to_path_buf(),
            frame: Some(Frame::from_image(image, 1)),
        })
    }
}

impl FrameSource for StillImageSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frame.take())
    }

    fn total_frames_hint(&self) -> Option<u64> {
        Some(1)
    }

    fn is_single_frame(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn recognises_image_extensions() {
        assert!(is_image_path(Path::new("a/b/photo.JPG")));
        assert!(is_image_path(Path::new("scene.webp")));
        assert!(!is_image_path(Path::new("clip.mp4")));
        assert!(!is_image_path(Path::new("noext")));
    }

    #[test]
    fn yields_a_single_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.png");
        RgbImage::from_pixel(6, 4, Rgb([1, 2, 3])).save(&path).unwrap();

        let mut source = StillImageSource::open(&path).unwrap();
        assert!(source.is_single_frame());
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!((frame.width, frame.height, frame.index), (6, 4, 1));
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn open_fails_for_corrupt_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        assert!(StillImageSource::open(&path).is_err());
    }
}
