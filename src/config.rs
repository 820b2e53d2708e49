use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::ClassMap;
use crate::classify::{ClassificationPolicy, FireLabel, DEFAULT_STAMPEDE_CUTOFF, DEFAULT_UNSAFE_THRESHOLD};
use crate::detect::InferenceParams;
use crate::ingest::FetchSettings;
use crate::insight::{InsightSink, NullSink, RestInsightSink, DEFAULT_INSIGHT_TABLE};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
#[cfg(feature = "backend-tract")]
const DEFAULT_BACKEND: &str = "tract";
#[cfg(not(feature = "backend-tract"))]
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "yolov8n.onnx";
const DEFAULT_INSIGHT_TIMEOUT_SECS: u64 = 10;
const MIN_INPUT_RESOLUTION: u32 = 32;
const MAX_INPUT_RESOLUTION: u32 = 4096;
const MAX_UPSCALE_FACTOR: f32 = 8.0;

#[derive(Debug, Deserialize, Default)]
struct RapidwarnConfigFile {
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    sampling: Option<SamplingConfigFile>,
    classification: Option<ClassificationConfigFile>,
    insight: Option<InsightConfigFile>,
    fetch: Option<FetchConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    allow_synthetic: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    overlap_threshold: Option<f32>,
    input_resolution: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    frame_stride: Option<u64>,
    upscale_factor: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassificationConfigFile {
    threshold: Option<u64>,
    stampede_cutoff: Option<u64>,
    person_class: Option<u32>,
    car_class: Option<u32>,
    fire_class: Option<u32>,
    fire_label: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct InsightConfigFile {
    url: Option<String>,
    table: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FetchConfigFile {
    timeout_secs: Option<u64>,
    max_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RapidwarnConfig {
    pub api_addr: String,
    /// Accept `stub://` locators on the HTTP API. Off by default.
    pub api_allow_synthetic: bool,
    pub detector: DetectorSettings,
    pub sampling: SamplingSettings,
    pub classification: ClassificationSettings,
    pub insight: InsightSettings,
    pub fetch: FetchSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub overlap_threshold: f32,
    pub input_resolution: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        let params = InferenceParams::default();
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            confidence_threshold: params.confidence_threshold,
            overlap_threshold: params.overlap_threshold,
            input_resolution: params.input_resolution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingSettings {
    pub frame_stride: u64,
    pub upscale_factor: f32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            frame_stride: 1,
            upscale_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationSettings {
    pub threshold: u64,
    pub stampede_cutoff: u64,
    pub classes: ClassMap,
    pub fire_label: FireLabel,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_UNSAFE_THRESHOLD,
            stampede_cutoff: DEFAULT_STAMPEDE_CUTOFF,
            classes: ClassMap::default(),
            fire_label: FireLabel::default(),
        }
    }
}

/// Where insights go. `api_key` only ever comes from the environment.
#[derive(Clone, PartialEq)]
pub struct InsightSettings {
    pub url: Option<String>,
    pub table: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for InsightSettings {
    fn default() -> Self {
        Self {
            url: None,
            table: DEFAULT_INSIGHT_TABLE.to_string(),
            api_key: None,
            timeout: Duration::from_secs(DEFAULT_INSIGHT_TIMEOUT_SECS),
        }
    }
}

impl std::fmt::Debug for InsightSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightSettings")
            .field("url", &self.url)
            .field("table", &self.table)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for RapidwarnConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            api_allow_synthetic: false,
            detector: DetectorSettings::default(),
            sampling: SamplingSettings::default(),
            classification: ClassificationSettings::default(),
            insight: InsightSettings::default(),
            fetch: FetchSettings::default(),
        }
    }
}

impl RapidwarnConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RAPIDWARN_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RapidwarnConfigFile) -> Result<Self> {
        let defaults = Self::default();

        let api_file = file.api.unwrap_or_default();
        let api_addr = api_file.addr.unwrap_or(defaults.api_addr);
        let api_allow_synthetic = api_file
            .allow_synthetic
            .unwrap_or(defaults.api_allow_synthetic);

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(defaults.detector.backend),
            model_path: detector_file
                .model_path
                .unwrap_or(defaults.detector.model_path),
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(defaults.detector.confidence_threshold),
            overlap_threshold: detector_file
                .overlap_threshold
                .unwrap_or(defaults.detector.overlap_threshold),
            input_resolution: detector_file
                .input_resolution
                .unwrap_or(defaults.detector.input_resolution),
        };

        let sampling_file = file.sampling.unwrap_or_default();
        let sampling = SamplingSettings {
            frame_stride: sampling_file
                .frame_stride
                .unwrap_or(defaults.sampling.frame_stride),
            upscale_factor: sampling_file
                .upscale_factor
                .unwrap_or(defaults.sampling.upscale_factor),
        };

        let class_file = file.classification.unwrap_or_default();
        let fire_label = match class_file.fire_label.as_deref() {
            Some(label) => label.parse()?,
            None => defaults.classification.fire_label,
        };
        let classification = ClassificationSettings {
            threshold: class_file
                .threshold
                .unwrap_or(defaults.classification.threshold),
            stampede_cutoff: class_file
                .stampede_cutoff
                .unwrap_or(defaults.classification.stampede_cutoff),
            classes: ClassMap {
                person: class_file
                    .person_class
                    .unwrap_or(defaults.classification.classes.person),
                car: class_file
                    .car_class
                    .unwrap_or(defaults.classification.classes.car),
                fire: class_file
                    .fire_class
                    .unwrap_or(defaults.classification.classes.fire),
            },
            fire_label,
        };

        let insight_file = file.insight.unwrap_or_default();
        let insight = InsightSettings {
            url: insight_file.url,
            table: insight_file.table.unwrap_or(defaults.insight.table),
            api_key: None,
            timeout: insight_file
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.insight.timeout),
        };

        let fetch_file = file.fetch.unwrap_or_default();
        let fetch = FetchSettings {
            timeout: fetch_file
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch.timeout),
            max_bytes: fetch_file.max_bytes.unwrap_or(defaults.fetch.max_bytes),
        };

        Ok(Self {
            api_addr,
            api_allow_synthetic,
            detector,
            sampling,
            classification,
            insight,
            fetch,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            if !port.trim().is_empty() {
                let port: u16 = port
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("PORT must be a TCP port number"))?;
                self.api_addr = format!("0.0.0.0:{port}");
            }
        }
        if let Ok(addr) = std::env::var("RAPIDWARN_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(backend) = std::env::var("RAPIDWARN_DETECTOR_BACKEND") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("RAPIDWARN_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = PathBuf::from(path);
            }
        }
        if let Ok(url) = std::env::var("RAPIDWARN_INSIGHT_URL") {
            if !url.trim().is_empty() {
                self.insight.url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("RAPIDWARN_INSIGHT_KEY") {
            if !key.trim().is_empty() {
                self.insight.api_key = Some(key);
            }
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api addr '{}' is not a valid socket address", self.api_addr))?;
        self.detector.backend = self.detector.backend.to_ascii_lowercase();
        validate_unit("detector.confidence_threshold", self.detector.confidence_threshold)?;
        validate_unit("detector.overlap_threshold", self.detector.overlap_threshold)?;
        validate_resolution(self.detector.input_resolution)?;
        validate_stride(self.sampling.frame_stride)?;
        validate_upscale(self.sampling.upscale_factor)?;
        let classes = &self.classification.classes;
        if classes.person == classes.car
            || classes.person == classes.fire
            || classes.car == classes.fire
        {
            return Err(anyhow!(
                "classification person/car/fire class ids must be distinct, got {}/{}/{}",
                classes.person,
                classes.car,
                classes.fire
            ));
        }
        if self.insight.table.trim().is_empty() {
            return Err(anyhow!("insight.table must not be empty"));
        }
        if self.fetch.max_bytes == 0 {
            return Err(anyhow!("fetch.max_bytes must be greater than zero"));
        }
        Ok(())
    }

    pub fn inference_params(&self) -> InferenceParams {
        InferenceParams {
            confidence_threshold: self.detector.confidence_threshold,
            overlap_threshold: self.detector.overlap_threshold,
            input_resolution: self.detector.input_resolution,
        }
    }

    pub fn classification_policy(&self) -> ClassificationPolicy {
        ClassificationPolicy {
            stampede_cutoff: self.classification.stampede_cutoff,
            unsafe_threshold: self.classification.threshold,
            fire_label: self.classification.fire_label,
        }
    }

    /// REST sink when a store url is configured, otherwise a null sink.
    pub fn build_sink(&self) -> Result<Box<dyn InsightSink>> {
        match &self.insight.url {
            Some(url) => {
                let sink = RestInsightSink::new(
                    url,
                    &self.insight.table,
                    self.insight.api_key.clone(),
                    self.insight.timeout,
                )?;
                log::info!("insights will be posted to {}", sink.endpoint());
                Ok(Box::new(sink))
            }
            None => {
                log::info!("no insight store configured; insights are discarded");
                Ok(Box::new(NullSink))
            }
        }
    }
}

pub(crate) fn validate_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{name} must be within [0, 1], got {value}"));
    }
    Ok(())
}

pub(crate) fn validate_resolution(value: u32) -> Result<()> {
    if !(MIN_INPUT_RESOLUTION..=MAX_INPUT_RESOLUTION).contains(&value) || value % 32 != 0 {
        return Err(anyhow!(
            "input_resolution must be a multiple of 32 within [{MIN_INPUT_RESOLUTION}, {MAX_INPUT_RESOLUTION}], got {value}"
        ));
    }
    Ok(())
}

pub(crate) fn validate_stride(value: u64) -> Result<()> {
    if value == 0 {
        return Err(anyhow!("frame_stride must be at least 1"));
    }
    Ok(())
}

pub(crate) fn validate_upscale(value: f32) -> Result<()> {
    if !(value > 0.0 && value <= MAX_UPSCALE_FACTOR) {
        return Err(anyhow!(
            "upscale_factor must be within (0, {MAX_UPSCALE_FACTOR}], got {value}"
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<RapidwarnConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
