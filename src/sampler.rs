//! Video sampler.
//!
//! Drives one frame source from `Opened` through `Sampling` to `Exhausted`.
//! Every decoded frame bumps a 1-based counter; only frames where
//! `counter % stride == 0` are preprocessed, sent to the detector and folded
//! into the running aggregate. Cancellation is checked before each sampled
//! frame, so an in-flight detection always completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::aggregate::{AggregateSummary, ClassMap, FrameTally, RunningAggregate};
use crate::detect::{DetectorBackend, Detection, InferenceParams};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::preprocess::{self, PrepareOptions};

const PROGRESS_EVERY: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerState {
    Opened,
    Sampling,
    Exhausted,
    Error,
}

/// Caller-side cancellation: an explicit flag plus an optional deadline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, after: Duration) -> Self {
        self.deadline = Some(Instant::now() + after);
        self
    }

    /// Shared flag, for signal handlers and other threads.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingOptions {
    pub stride: u64,
    pub prepare: PrepareOptions,
    pub params: InferenceParams,
    pub classes: ClassMap,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            stride: 1,
            prepare: PrepareOptions::default(),
            params: InferenceParams::default(),
            classes: ClassMap::default(),
        }
    }
}

/// Receives every decoded frame, in order. Used for rendered output.
///
/// Detections passed to `on_sampled` are already in the original frame's
/// coordinate space.
pub trait FrameObserver {
    fn on_sampled(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        aggregate: &RunningAggregate,
    ) -> Result<()>;

    fn on_skipped(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl FrameObserver for NoopObserver {
    fn on_sampled(&mut self, _: &Frame, _: &[Detection], _: &RunningAggregate) -> Result<()> {
        Ok(())
    }
}

pub struct VideoSampler<'a> {
    options: SamplingOptions,
    cancel: &'a CancelToken,
    state: SamplerState,
}

impl<'a> VideoSampler<'a> {
    pub fn new(options: SamplingOptions, cancel: &'a CancelToken) -> Self {
        Self {
            options,
            cancel,
            state: SamplerState::Opened,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    fn transition(&mut self, next: SamplerState) {
        log::debug!("sampler: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Sample `source` to exhaustion and return the finalized aggregate.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        backend: &mut dyn DetectorBackend,
        observer: &mut dyn FrameObserver,
    ) -> Result<AggregateSummary, PipelineError> {
        let result = self.sample(source, backend, observer);
        if result.is_err() {
            self.transition(SamplerState::Error);
        }
        result
    }

    fn sample(
        &mut self,
        source: &mut dyn FrameSource,
        backend: &mut dyn DetectorBackend,
        observer: &mut dyn FrameObserver,
    ) -> Result<AggregateSummary, PipelineError> {
        if self.options.stride == 0 {
            return Err(PipelineError::InvalidRequest(
                "frame_stride must be at least 1".to_string(),
            ));
        }
        let stride = if source.is_single_frame() {
            1
        } else {
            self.options.stride
        };
        let source_id = source.describe();
        let mut aggregate = RunningAggregate::new();
        let mut counter: u64 = 0;

        self.transition(SamplerState::Sampling);
        loop {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => return Err(PipelineError::source_unavailable(&source_id, &err)),
            };
            counter += 1;
            aggregate.record_decoded();

            if counter % stride != 0 {
                observer
                    .on_skipped(&frame)
                    .map_err(|err| PipelineError::Render(format!("{err:#}")))?;
                continue;
            }

            if self.cancel.is_cancelled() {
                log::info!(
                    "sampler: cancelled {} after {} sampled frames",
                    source_id,
                    aggregate.frames_sampled()
                );
                return Err(PipelineError::Cancelled {
                    frames_sampled: aggregate.frames_sampled(),
                });
            }

            let detections = self.detect_frame(&frame, backend)?;
            aggregate.fold(FrameTally::from_detections(
                &detections,
                &self.options.classes,
            ));
            observer
                .on_sampled(&frame, &detections, &aggregate)
                .map_err(|err| PipelineError::Render(format!("{err:#}")))?;

            if aggregate.frames_sampled() % PROGRESS_EVERY == 0 {
                log::debug!(
                    "sampler: {} sampled {} of {} decoded frames (max persons {})",
                    source_id,
                    aggregate.frames_sampled(),
                    aggregate.frames_total(),
                    aggregate.max_persons_per_frame()
                );
            }
        }

        self.transition(SamplerState::Exhausted);
        Ok(aggregate.finalize())
    }

    fn detect_frame(
        &self,
        frame: &Frame,
        backend: &mut dyn DetectorBackend,
    ) -> Result<Vec<Detection>, PipelineError> {
        let failure = |err: anyhow::Error| PipelineError::DetectionFailure {
            frame_index: frame.index,
            reason: format!("{err:#}"),
        };
        let (processed, transform) =
            preprocess::prepare(frame, &self.options.prepare).map_err(failure)?;
        let detections = backend
            .detect(&processed, &self.options.params)
            .map_err(failure)?;
        Ok(detections
            .into_iter()
            .map(|det| Detection {
                bbox: transform
                    .to_original(det.bbox)
                    .clamp_to(frame.width, frame.height),
                ..det
            })
            .collect())
    }
}
