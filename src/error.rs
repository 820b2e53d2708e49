use thiserror::Error;

use crate::ingest::FetchError;

/// Errors surfaced by `Analyzer::analyze`.
///
/// Insight persistence never appears here: sink failures are logged and
/// reported through `AnalysisReport::insight_persisted`.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The media could not be fetched, opened or decoded. `download_failed`
    /// is set only when the remote fetch itself failed.
    #[error("source unavailable ({source_id}): {reason}")]
    SourceUnavailable {
        source_id: String,
        reason: String,
        download_failed: bool,
    },

    /// The detector backend failed on a sampled frame.
    #[error("detection failed on frame {frame_index}: {reason}")]
    DetectionFailure { frame_index: u64, reason: String },

    /// The caller cancelled between sampled frames.
    #[error("analysis cancelled after {frames_sampled} sampled frames")]
    Cancelled { frames_sampled: u64 },

    /// Request parameters failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The rendered-output writer failed.
    #[error("render failed: {0}")]
    Render(String),
}

impl PipelineError {
    pub fn source_unavailable(source_id: impl Into<String>, err: &anyhow::Error) -> Self {
        PipelineError::SourceUnavailable {
            source_id: source_id.into(),
            reason: format!("{err:#}"),
            download_failed: err.downcast_ref::<FetchError>().is_some(),
        }
    }

    /// Stable machine-readable code for structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "source_unavailable",
            PipelineError::DetectionFailure { .. } => "detection_failure",
            PipelineError::Cancelled { .. } => "cancelled",
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::Render(_) => "render_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_unavailable_keeps_context_chain() {
        let err = anyhow::anyhow!("no such file").context("open video");
        let e = PipelineError::source_unavailable("/tmp/missing.mp4", &err);
        let msg = e.to_string();
        assert!(msg.contains("/tmp/missing.mp4"));
        assert!(msg.contains("open video"));
        assert!(msg.contains("no such file"));
        assert_eq!(e.kind(), "source_unavailable");
        assert!(matches!(
            e,
            PipelineError::SourceUnavailable {
                download_failed: false,
                ..
            }
        ));
    }

    #[test]
    fn fetch_errors_are_flagged_through_context() {
        let err = anyhow::Error::new(FetchError {
            url: "http://cdn.example.com/a.mp4".to_string(),
            reason: "status code 404".to_string(),
        })
        .context("open remote media");
        let e = PipelineError::source_unavailable("http://cdn.example.com/a.mp4", &err);
        assert!(matches!(
            e,
            PipelineError::SourceUnavailable {
                download_failed: true,
                ..
            }
        ));
    }
}
