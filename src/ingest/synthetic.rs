//! Synthetic frame source (`stub://`).
//!
//! Locators look like `stub://<name>?frames=120&width=64&height=48`. Frames are
//! deterministic functions of their index so repeated runs see identical
//! pixels. Unknown query keys are ignored.

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::FrameSource;
use crate::frame::Frame;

const DEFAULT_FRAMES: u64 = 30;
const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;
/// Upper bound on either synthetic frame side.
pub const MAX_SYNTHETIC_SIDE: u32 = 4096;
/// Upper bound on synthetic stream length.
pub const MAX_SYNTHETIC_FRAMES: u64 = 100_000;

/// Configuration for a synthetic source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            frames: DEFAULT_FRAMES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic source dimensions must be non-zero"));
        }
        if config.width > MAX_SYNTHETIC_SIDE || config.height > MAX_SYNTHETIC_SIDE {
            return Err(anyhow!(
                "synthetic source {}x{} exceeds {MAX_SYNTHETIC_SIDE} px per side",
                config.width,
                config.height
            ));
        }
        if config.frames > MAX_SYNTHETIC_FRAMES {
            return Err(anyhow!(
                "synthetic source of {} frames exceeds the {MAX_SYNTHETIC_FRAMES} frame limit",
                config.frames
            ));
        }
        log::info!(
            "SyntheticSource: {} ({} frames, {}x{})",
            config.name,
            config.frames,
            config.width,
            config.height
        );
        Ok(Self {
            config,
            frame_count: 0,
        })
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let mut config = SyntheticConfig {
            name: url.host_str().unwrap_or("synthetic").to_string(),
            ..SyntheticConfig::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    config.frames = value
                        .parse()
                        .with_context(|| format!("invalid frames '{value}' in {url}"))?
                }
                "width" => {
                    config.width = value
                        .parse()
                        .with_context(|| format!("invalid width '{value}' in {url}"))?
                }
                "height" => {
                    config.height = value
                        .parse()
                        .with_context(|| format!("invalid height '{value}' in {url}"))?
                }
                _ => {}
            }
        }
        Self::new(config)
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let len = self.config.width as usize * self.config.height as usize * 3;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count * 3) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("stub://{}", self.config.name)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.frame_count >= self.config.frames {
            return Ok(None);
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
        .map(Some)
    }

    fn total_frames_hint(&self) -> Option<u64> {
        Some(self.config.frames)
    }
}
