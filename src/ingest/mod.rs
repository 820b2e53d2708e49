//! Media ingestion.
//!
//! This module turns a media locator into a stream of decoded frames:
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Local still images (jpg, png, bmp, webp)
//! - Remote `http(s)://` media, fetched to a temporary local file first
//! - Synthetic `stub://` streams (testing and dry runs)
//!
//! Every source is read front to back exactly once. Sources own their decoder
//! handles and release them on drop, so every exit path closes the stream.

pub mod fetch;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod still;
pub mod synthetic;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::frame::Frame;

pub use fetch::{fetch_to_temp, FetchError, FetchSettings, FetchedMedia};
pub use file::FileSource;
pub use still::StillImageSource;
pub use synthetic::SyntheticSource;

/// A decoded frame stream.
pub trait FrameSource {
    /// Identifier used in logs and error messages.
    fn describe(&self) -> String;

    /// Next decoded frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Frame count announced by the container, when known.
    fn total_frames_hint(&self) -> Option<u64> {
        None
    }

    /// True for sources that only ever yield one frame (still images).
    fn is_single_frame(&self) -> bool {
        false
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn total_frames_hint(&self) -> Option<u64> {
        (**self).total_frames_hint()
    }

    fn is_single_frame(&self) -> bool {
        (**self).is_single_frame()
    }
}

/// Where media comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaLocator {
    Local(PathBuf),
    Remote(Url),
    Synthetic(Url),
}

impl MediaLocator {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("media locator is empty"));
        }
        let lower = raw.to_ascii_lowercase();
        if lower.starts_with("stub://") {
            let url = Url::parse(raw).with_context(|| format!("parse synthetic locator {raw}"))?;
            return Ok(MediaLocator::Synthetic(url));
        }
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(raw).with_context(|| format!("parse media url {raw}"))?;
            return Ok(MediaLocator::Remote(url));
        }
        if raw.contains("://") {
            return Err(anyhow!(
                "unsupported media locator '{}'; expected a local path, http(s):// or stub://",
                raw
            ));
        }
        Ok(MediaLocator::Local(PathBuf::from(raw)))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, MediaLocator::Remote(_))
    }
}

impl std::fmt::Display for MediaLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaLocator::Local(path) => write!(f, "{}", path.display()),
            MediaLocator::Remote(url) | MediaLocator::Synthetic(url) => write!(f, "{url}"),
        }
    }
}

/// An opened source plus whatever must outlive it (a downloaded temp file).
pub struct OpenedMedia {
    pub source: Box<dyn FrameSource>,
    _download: Option<FetchedMedia>,
}

impl OpenedMedia {
    pub fn describe(&self) -> String {
        self.source.describe()
    }
}

/// Resolve a locator to a readable frame source.
///
/// Remote media is downloaded first; the temporary file lives as long as the
/// returned `OpenedMedia`.
pub fn open(locator: &MediaLocator, fetch: &FetchSettings) -> Result<OpenedMedia> {
    match locator {
        MediaLocator::Synthetic(url) => Ok(OpenedMedia {
            source: Box::new(SyntheticSource::from_url(url)?),
            _download: None,
        }),
        MediaLocator::Local(path) => Ok(OpenedMedia {
            source: file::open_path(path)?,
            _download: None,
        }),
        MediaLocator::Remote(url) => {
            let fetched = fetch_to_temp(url, fetch)?;
            let source = file::open_path(fetched.path())
                .with_context(|| format!("open media downloaded from {url}"))?;
            Ok(OpenedMedia {
                source,
                _download: Some(fetched),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_locator_kinds() {
        assert!(matches!(
            MediaLocator::parse("/videos/crowd.mp4").unwrap(),
            MediaLocator::Local(_)
        ));
        assert!(MediaLocator::parse("HTTPS://cdn.example.com/a.mp4")
            .unwrap()
            .is_remote());
        assert!(matches!(
            MediaLocator::parse("stub://crowd?frames=3").unwrap(),
            MediaLocator::Synthetic(_)
        ));
        assert!(MediaLocator::parse("rtsp://camera/1").is_err());
        assert!(MediaLocator::parse("   ").is_err());
    }

    #[test]
    fn opens_synthetic_locator() {
        let locator = MediaLocator::parse("stub://crowd?frames=2&width=8&height=4").unwrap();
        let mut opened = open(&locator, &FetchSettings::default()).unwrap();
        assert_eq!(opened.source.total_frames_hint(), Some(2));
        assert!(opened.source.next_frame().unwrap().is_some());
        assert!(opened.source.next_frame().unwrap().is_some());
        assert!(opened.source.next_frame().unwrap().is_none());
    }
}
