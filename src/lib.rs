//! RapidWarn
//!
//! Turns crowd footage into a coarse safety judgment.
//!
//! # Architecture
//!
//! A processing call flows through these stages:
//!
//! 1. **Ingest**: a media locator (local path, `http(s)://` url, `stub://`)
//!    is opened as a stream of decoded frames. Remote media is downloaded to
//!    a temporary file first.
//! 2. **Sample**: every `frame_stride`-th decoded frame is sharpened, rescaled
//!    and handed to a detector backend.
//! 3. **Aggregate**: detections are counted per frame and folded into a
//!    running aggregate (max persons per frame, total cars, total fires).
//! 4. **Classify**: the finalized aggregate yields a disaster type and a
//!    SAFE/UNSAFE status.
//! 5. **Publish**: one insight record is handed to the insight sink. Sink
//!    failures are logged and never fail the call.
//!
//! # Module Structure
//!
//! - `frame`: decoded RGB raster
//! - `detect`: detector backends (stub, tract/YOLOv8) and their registry
//! - `preprocess`: sharpening, rescaling, coordinate transforms
//! - `ingest`: frame sources and remote fetch
//! - `sampler`: stride sampling state machine with cancellation
//! - `aggregate`, `classify`: counting and labelling
//! - `insight`: insight records and sinks
//! - `render`: optional annotated output
//! - `pipeline`: one analysis call end to end
//! - `api`: HTTP front end

pub mod aggregate;
pub mod api;
pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod insight;
pub mod pipeline;
pub mod preprocess;
pub mod render;
pub mod sampler;

pub use aggregate::{AggregateSummary, ClassMap, FrameTally, RunningAggregate};
pub use classify::{
    classify, Classification, ClassificationPolicy, DisasterType, FireLabel, SafetyStatus,
};
pub use config::RapidwarnConfig;
pub use detect::{
    BBox, BackendRegistry, Detection, DetectorBackend, InferenceParams, SharedBackend, StubBackend,
};
pub use error::PipelineError;
pub use frame::Frame;
pub use ingest::{FrameSource, MediaLocator};
pub use insight::{Insight, InsightSink, MemorySink, NullSink, RestInsightSink};
pub use pipeline::{AnalysisOverrides, AnalysisReport, AnalysisRequest, Analyzer};
pub use preprocess::{prepare, CoordinateTransform, PrepareOptions};
pub use sampler::{CancelToken, SamplerState, SamplingOptions, VideoSampler};
