//! One processing call, end to end.
//!
//! `Analyzer::analyze` resolves per-request overrides against the loaded
//! configuration, opens the media, samples it, classifies the finalized
//! aggregate and hands exactly one insight to the sink. The stages are also
//! exposed individually (`prepare`, `PreparedRun::sample`,
//! `SampledRun::publish`) so front ends can report progress between them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregateSummary, ClassMap, RunningAggregate};
use crate::classify::{classify, Classification, ClassificationPolicy, DisasterType, SafetyStatus};
use crate::config::{self, RapidwarnConfig};
use crate::detect::{Detection, DetectorBackend};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::{self, MediaLocator, OpenedMedia};
use crate::insight::{self, Insight, InsightSink};
use crate::preprocess::PrepareOptions;
use crate::render::{self, OverlayRenderer};
use crate::sampler::{CancelToken, FrameObserver, NoopObserver, SamplingOptions, VideoSampler};

/// Optional per-request knobs layered over the loaded configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOverrides {
    pub threshold: Option<u64>,
    pub confidence_threshold: Option<f32>,
    pub input_resolution: Option<u32>,
    /// Validated (0 < f <= 8) but not applied by analysis runs: frames are
    /// resized straight to the square `input_resolution`, which supersedes
    /// any upscale. See `preprocess::prepare`.
    pub upscale_factor: Option<f32>,
    pub frame_stride: Option<u64>,
    pub output_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalysisRequest {
    /// Local path, `http(s)://` url or `stub://` locator.
    pub locator: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub overrides: AnalysisOverrides,
}

impl AnalysisRequest {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            ..Self::default()
        }
    }
}

/// What the caller gets back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub disaster_type: DisasterType,
    pub max_persons: u64,
    /// Same value as `max_persons`.
    pub person_count: u64,
    pub cars_detected: u64,
    pub fires_detected: u64,
    pub status: SafetyStatus,
    pub processed_frames: u64,
    pub total_frames: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub insight_persisted: bool,
    pub insight: Insight,
}

impl AnalysisReport {
    fn new(
        classification: &Classification,
        insight: Insight,
        insight_persisted: bool,
        output_path: Option<PathBuf>,
    ) -> Self {
        let summary = &classification.summary;
        Self {
            disaster_type: classification.disaster_type,
            max_persons: summary.max_persons_per_frame,
            person_count: summary.max_persons_per_frame,
            cars_detected: summary.total_cars,
            fires_detected: summary.total_fires,
            status: classification.status,
            processed_frames: summary.frames_sampled,
            total_frames: summary.frames_total,
            output_path,
            insight_persisted,
            insight,
        }
    }
}

/// Effective settings for one call.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSettings {
    pub sampling: SamplingOptions,
    pub policy: ClassificationPolicy,
    pub output_path: Option<PathBuf>,
}

pub struct Analyzer {
    config: RapidwarnConfig,
}

impl Analyzer {
    pub fn new(config: RapidwarnConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RapidwarnConfig {
        &self.config
    }

    /// Layer `overrides` over the configuration and validate the result.
    pub fn resolve(&self, overrides: &AnalysisOverrides) -> Result<RunSettings, PipelineError> {
        let invalid = |err: anyhow::Error| PipelineError::InvalidRequest(err.to_string());

        let mut params = self.config.inference_params();
        if let Some(confidence) = overrides.confidence_threshold {
            config::validate_unit("confidence_threshold", confidence).map_err(invalid)?;
            params.confidence_threshold = confidence;
        }
        if let Some(resolution) = overrides.input_resolution {
            config::validate_resolution(resolution).map_err(invalid)?;
            params.input_resolution = resolution;
        }
        let stride = overrides
            .frame_stride
            .unwrap_or(self.config.sampling.frame_stride);
        config::validate_stride(stride).map_err(invalid)?;
        let upscale_factor = overrides
            .upscale_factor
            .unwrap_or(self.config.sampling.upscale_factor);
        config::validate_upscale(upscale_factor).map_err(invalid)?;

        let mut policy = self.config.classification_policy();
        if let Some(threshold) = overrides.threshold {
            policy.unsafe_threshold = threshold;
        }

        let classes: ClassMap = self.config.classification.classes;
        Ok(RunSettings {
            sampling: SamplingOptions {
                stride,
                prepare: PrepareOptions {
                    target_size: Some(params.input_resolution),
                    upscale_factor,
                },
                params,
                classes,
            },
            policy,
            output_path: overrides.output_path.clone(),
        })
    }

    /// Resolve settings and open the media. Remote media is downloaded here.
    pub fn prepare(&self, request: &AnalysisRequest) -> Result<PreparedRun, PipelineError> {
        let settings = self.resolve(&request.overrides)?;
        let locator = MediaLocator::parse(&request.locator)
            .map_err(|err| PipelineError::InvalidRequest(format!("{err:#}")))?;
        let media = ingest::open(&locator, &self.config.fetch)
            .map_err(|err| PipelineError::source_unavailable(locator.to_string(), &err))?;
        log::info!(
            "analysis of {} (stride {}, threshold {}, total frames ~{})",
            media.describe(),
            settings.sampling.stride,
            settings.policy.unsafe_threshold,
            media
                .source
                .total_frames_hint()
                .map_or_else(|| "?".to_string(), |n| n.to_string())
        );
        Ok(PreparedRun {
            locator,
            media,
            settings,
            latitude: request.latitude,
            longitude: request.longitude,
        })
    }

    pub fn analyze(
        &self,
        request: &AnalysisRequest,
        backend: &mut dyn DetectorBackend,
        sink: &mut dyn InsightSink,
        cancel: &CancelToken,
    ) -> Result<AnalysisReport, PipelineError> {
        let run = self.prepare(request)?;
        let sampled = run.sample(backend, cancel)?;
        Ok(sampled.publish(sink))
    }
}

/// Media opened and settings resolved; nothing sampled yet.
pub struct PreparedRun {
    locator: MediaLocator,
    media: OpenedMedia,
    settings: RunSettings,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl PreparedRun {
    pub fn locator(&self) -> &MediaLocator {
        &self.locator
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn total_frames_hint(&self) -> Option<u64> {
        self.media.source.total_frames_hint()
    }

    /// Sample the media to exhaustion and classify it. The media (and any
    /// downloaded temp file) is released when this returns.
    pub fn sample(
        self,
        backend: &mut dyn DetectorBackend,
        cancel: &CancelToken,
    ) -> Result<SampledRun, PipelineError> {
        self.sample_with_progress(backend, cancel, &mut |_| {})
    }

    /// Like `sample`, reporting the number of decoded frames after each one.
    pub fn sample_with_progress(
        mut self,
        backend: &mut dyn DetectorBackend,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u64),
    ) -> Result<SampledRun, PipelineError> {
        let mut sampler = VideoSampler::new(self.settings.sampling, cancel);
        let source = self.media.source.as_mut();

        let (summary, output_path) = match &self.settings.output_path {
            Some(path) => {
                let writer = render::open_writer(path)
                    .map_err(|err| PipelineError::Render(format!("{err:#}")))?;
                let mut renderer = OverlayRenderer::new(
                    writer,
                    self.settings.sampling.classes,
                    self.settings.policy.unsafe_threshold,
                );
                let summary = sampler.run(
                    source,
                    backend,
                    &mut Progress::new(&mut renderer, &mut *progress),
                )?;
                let written = renderer
                    .finish()
                    .map_err(|err| PipelineError::Render(format!("{err:#}")))?;
                (summary, Some(written))
            }
            None => {
                let summary = sampler.run(
                    source,
                    backend,
                    &mut Progress::new(&mut NoopObserver, &mut *progress),
                )?;
                (summary, None)
            }
        };

        let classification = classify(summary, &self.settings.policy);
        log_classification(&self.locator, &summary, &classification);
        Ok(SampledRun {
            classification,
            output_path,
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }
}

/// Forwards to an inner observer and counts decoded frames.
struct Progress<'a, F: FnMut(u64)> {
    inner: &'a mut dyn FrameObserver,
    report: F,
    decoded: u64,
}

impl<'a, F: FnMut(u64)> Progress<'a, F> {
    fn new(inner: &'a mut dyn FrameObserver, report: F) -> Self {
        Self {
            inner,
            report,
            decoded: 0,
        }
    }

    fn tick(&mut self) {
        self.decoded += 1;
        (self.report)(self.decoded);
    }
}

impl<F: FnMut(u64)> FrameObserver for Progress<'_, F> {
    fn on_sampled(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        aggregate: &RunningAggregate,
    ) -> anyhow::Result<()> {
        self.inner.on_sampled(frame, detections, aggregate)?;
        self.tick();
        Ok(())
    }

    fn on_skipped(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.inner.on_skipped(frame)?;
        self.tick();
        Ok(())
    }
}

fn log_classification(
    locator: &MediaLocator,
    summary: &AggregateSummary,
    classification: &Classification,
) {
    log::info!(
        "{}: {} / {} (max persons {}, cars {}, fires {}, {} of {} frames sampled)",
        locator,
        classification.disaster_type,
        classification.status,
        summary.max_persons_per_frame,
        summary.total_cars,
        summary.total_fires,
        summary.frames_sampled,
        summary.frames_total
    );
}

/// Classification done; the insight has not been published yet.
pub struct SampledRun {
    classification: Classification,
    output_path: Option<PathBuf>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl SampledRun {
    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    /// Build the insight, hand it to `sink` once and assemble the report.
    /// A failing sink only clears `insight_persisted`.
    pub fn publish(self, sink: &mut dyn InsightSink) -> AnalysisReport {
        let insight =
            Insight::from_classification(&self.classification, self.latitude, self.longitude);
        let persisted = insight::publish(sink, &insight);
        AnalysisReport::new(&self.classification, insight, persisted, self.output_path)
    }
}
