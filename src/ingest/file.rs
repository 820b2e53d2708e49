//! Local file frame source.
//!
//! Local paths are routed by extension: still images decode through the
//! `image` crate, everything else is treated as video and needs the
//! `ingest-file-ffmpeg` feature.

use std::path::Path;

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::still::{is_image_path, StillImageSource};
use super::FrameSource;
use crate::frame::Frame;

/// Local video file source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("no such media file: {}", path.display()));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(Self {
                backend: FileBackend::Ffmpeg(FfmpegFileSource::open(path)?),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "video decoding of {} requires the ingest-file-ffmpeg feature",
                path.display()
            ))
        }
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        match self.backend {
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(ref source) => source.describe(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.backend {
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(ref mut source) => source.next_frame(),
        }
    }

    fn total_frames_hint(&self) -> Option<u64> {
        match self.backend {
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(ref source) => source.total_frames_hint(),
        }
    }
}

/// Open a local path as either a still image or a video.
pub fn open_path(path: &Path) -> Result<Box<dyn FrameSource>> {
    if path.as_os_str().is_empty() {
        return Err(anyhow!("media path is empty"));
    }
    if is_image_path(path) {
        return Ok(Box::new(StillImageSource::open(path)?));
    }
    Ok(Box::new(FileSource::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_fails_to_open() {
        let err = open_path(Path::new("/definitely/not/here.mp4"))
            .err()
            .expect("missing file must not open");
        assert!(err.to_string().contains("here.mp4"));
    }

    #[test]
    fn image_paths_open_as_stills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.bmp");
        image::RgbImage::new(3, 3).save(&path).unwrap();
        let source = open_path(&path).unwrap();
        assert!(source.is_single_frame());
    }
}
