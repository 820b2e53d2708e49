use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, InferenceParams};
use crate::frame::Frame;

/// Deterministic backend for tests and dry runs.
///
/// Replays a script of per-call detections (cycling when the script is
/// shorter than the run), applies the confidence threshold the way a real
/// backend would, and records how often and on what it was called.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    fail_on_call: Option<u64>,
    calls: u64,
    last_input: Option<(u32, u32)>,
}

impl StubBackend {
    /// A backend that never detects anything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the same detections for every frame.
    pub fn fixed(detections: Vec<Detection>) -> Self {
        Self::scripted(vec![detections])
    }

    /// Returns `script[n % script.len()]` on the n-th call (0-based).
    pub fn scripted(script: Vec<Vec<Detection>>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Make the given 1-based call fail.
    pub fn failing_on_call(mut self, call: u64) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Dimensions of the most recent frame handed to `detect`.
    pub fn last_input(&self) -> Option<(u32, u32)> {
        self.last_input
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>> {
        self.calls += 1;
        self.last_input = Some((frame.width, frame.height));

        if self.fail_on_call == Some(self.calls) {
            return Err(anyhow!("stub backend scripted failure on call {}", self.calls));
        }
        if self.script.is_empty() {
            return Ok(Vec::new());
        }

        let idx = ((self.calls - 1) % self.script.len() as u64) as usize;
        Ok(self.script[idx]
            .iter()
            .filter(|d| d.confidence >= params.confidence_threshold)
            .copied()
            .collect())
    }
}
