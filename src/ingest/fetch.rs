//! Remote media download.
//!
//! `http(s)://` media is streamed into a named temporary file whose suffix
//! follows the URL path extension (`.mp4` when there is none), so the local
//! decoder can pick a demuxer from the name. The file is removed when the
//! returned [`FetchedMedia`] is dropped.

use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use url::Url;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_FETCH_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_SUFFIX: &str = ".mp4";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_bytes: DEFAULT_MAX_FETCH_BYTES,
        }
    }
}

/// The remote side failed: unreachable host, HTTP error status, or a body
/// that was unreadable, empty or over the size cap. Local failures after a
/// successful download (temp file, decoding) are not `FetchError`s.
#[derive(Debug, thiserror::Error)]
#[error("{url}: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

impl FetchError {
    fn new(url: &Url, reason: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// A downloaded media file. Deleted on drop.
pub struct FetchedMedia {
    file: NamedTempFile,
    bytes: u64,
}

impl FetchedMedia {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

pub fn fetch_to_temp(url: &Url, settings: &FetchSettings) -> Result<FetchedMedia> {
    let agent = ureq::AgentBuilder::new()
        .timeout(settings.timeout)
        .build();
    let response = agent
        .get(url.as_str())
        .call()
        .map_err(|err| FetchError::new(url, err.to_string()))?;

    let mut file = tempfile::Builder::new()
        .prefix("rapidwarn-")
        .suffix(&suffix_for(url))
        .tempfile()
        .context("create temporary media file")?;

    let mut reader = response.into_reader().take(settings.max_bytes + 1);
    let bytes = io::copy(&mut reader, file.as_file_mut())
        .map_err(|err| FetchError::new(url, format!("reading body: {err}")))?;
    if bytes > settings.max_bytes {
        return Err(FetchError::new(
            url,
            format!("body exceeds the {} byte download limit", settings.max_bytes),
        )
        .into());
    }
    if bytes == 0 {
        return Err(FetchError::new(url, "body is empty").into());
    }

    log::info!(
        "fetched {} bytes from {} into {}",
        bytes,
        url,
        file.path().display()
    );
    Ok(FetchedMedia { file, bytes })
}

/// `.ext` taken from the last URL path segment, or `.mp4`.
pub fn suffix_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}
