//! Blocking HTTP/1.1 front end for the analysis pipeline.
//!
//! One connection is served at a time on a background thread; each request
//! runs its own analysis call with its own aggregate. Routes:
//!
//! - `GET /` banner
//! - `GET /health`
//! - `POST /analyze` `{url, latitude, longitude, ...overrides}`
//! - `POST /predict` `{path, output_path?}` (local files, rendered output)

use crate::detect::SharedBackend;
use crate::error::PipelineError;
use crate::ingest::MediaLocator;
use crate::insight::InsightSink;
use crate::pipeline::{AnalysisOverrides, AnalysisRequest, Analyzer};
use crate::sampler::CancelToken;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const BANNER: &str = "RapidWarn analysis API is running.";

#[cfg(feature = "ingest-file-ffmpeg")]
const DEFAULT_PREDICT_OUTPUT: &str = "output.mp4";
#[cfg(not(feature = "ingest-file-ffmpeg"))]
const DEFAULT_PREDICT_OUTPUT: &str = "output_frames";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Accept `stub://` locators on `/analyze`.
    pub allow_synthetic: bool,
    pub max_body_bytes: usize,
    pub read_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            allow_synthetic: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    ctx: ApiContext,
}

struct ApiContext {
    allow_synthetic: bool,
    analyzer: Analyzer,
    backend: SharedBackend,
    sink: Box<dyn InsightSink>,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        analyzer: Analyzer,
        backend: SharedBackend,
        sink: Box<dyn InsightSink>,
    ) -> Self {
        Self {
            ctx: ApiContext {
                allow_synthetic: cfg.allow_synthetic,
                analyzer,
                backend,
                sink,
            },
            cfg,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let mut ctx = self.ctx;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &cfg, &mut ctx, shutdown_thread) {
                log::error!("analysis api stopped: {}", err);
            }
        });
        log::info!("analysis api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: &ApiConfig,
    ctx: &mut ApiContext,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, cfg, ctx) {
                    log::warn!("analysis api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, ctx: &mut ApiContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream, cfg)?;
    if request.content_length > cfg.max_body_bytes {
        write_json_response(&mut stream, 413, &json!({"error": "Request body too large"}))?;
        return Err(anyhow!(
            "{} {} body of {} bytes exceeds limit",
            request.method,
            request.path,
            request.content_length
        ));
    }
    let response = route(ctx, &request);
    if response.status >= 400 {
        log::warn!(
            "{} {} -> {} {}",
            request.method,
            request.path,
            response.status,
            response.body
        );
    }
    write_response(
        &mut stream,
        response.status,
        response.content_type,
        response.body.as_bytes(),
    )
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.to_string(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }
}

fn route(ctx: &mut ApiContext, request: &HttpRequest) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => Response::text(200, BANNER),
        ("GET", "/health") => Response::json(200, json!({"status": "ok"})),
        ("POST", "/analyze") => analyze(ctx, &request.body),
        ("POST", "/predict") => predict(ctx, &request.body),
        (_, "/" | "/health" | "/analyze" | "/predict") => {
            Response::error(405, "method_not_allowed")
        }
        _ => Response::error(404, "not_found"),
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeBody {
    url: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(flatten)]
    overrides: AnalysisOverrides,
}

#[derive(Debug, Deserialize)]
struct PredictBody {
    path: Option<String>,
    #[serde(flatten)]
    overrides: AnalysisOverrides,
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|err| Response::error(400, &format!("Invalid JSON body: {err}")))
}

fn analyze(ctx: &mut ApiContext, body: &[u8]) -> Response {
    let body: AnalyzeBody = match parse_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let url = match body.url {
        Some(url) if !url.trim().is_empty() => url,
        _ => return Response::error(400, "Missing 'url'"),
    };
    let (latitude, longitude) = match (body.latitude, body.longitude) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return Response::error(400, "Missing 'latitude' or 'longitude'"),
    };
    let synthetic = matches!(MediaLocator::parse(&url), Ok(MediaLocator::Synthetic(_)));
    if synthetic && !ctx.allow_synthetic {
        return Response::json(
            400,
            json!({"error": "Synthetic 'stub://' sources are disabled", "kind": "invalid_request"}),
        );
    }

    let request = AnalysisRequest {
        locator: url,
        latitude: Some(latitude),
        longitude: Some(longitude),
        overrides: body.overrides,
    };
    match run_analysis(ctx, &request) {
        Ok(report) => Response::json(200, json!({"result": "processed", "insight": report})),
        Err(PipelineError::SourceUnavailable {
            reason,
            download_failed: true,
            ..
        }) => Response::error(502, &format!("Download failed: {reason}")),
        Err(err) => pipeline_error_response(&err),
    }
}

fn predict(ctx: &mut ApiContext, body: &[u8]) -> Response {
    let body: PredictBody = match parse_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let path = match body.path {
        Some(path) if Path::new(&path).exists() => path,
        _ => return Response::error(400, "Invalid path"),
    };
    let mut overrides = body.overrides;
    if overrides.output_path.is_none() {
        overrides.output_path = Some(PathBuf::from(DEFAULT_PREDICT_OUTPUT));
    }
    let request = AnalysisRequest {
        locator: path,
        latitude: None,
        longitude: None,
        overrides,
    };
    match run_analysis(ctx, &request) {
        Ok(report) => Response::json(
            200,
            json!({
                "result": "Video processed",
                "output_file": report.output_path,
                "report": report,
            }),
        ),
        Err(err) => pipeline_error_response(&err),
    }
}

fn run_analysis(
    ctx: &mut ApiContext,
    request: &AnalysisRequest,
) -> Result<crate::pipeline::AnalysisReport, PipelineError> {
    let mut backend = ctx.backend.lock().map_err(|_| PipelineError::DetectionFailure {
        frame_index: 0,
        reason: "detector backend lock poisoned".to_string(),
    })?;
    let cancel = CancelToken::new();
    ctx.analyzer
        .analyze(request, &mut *backend, ctx.sink.as_mut(), &cancel)
}

fn pipeline_error_response(err: &PipelineError) -> Response {
    let status = match err {
        PipelineError::InvalidRequest(_) => 400,
        _ => 500,
    };
    Response::json(status, json!({"error": err.to_string(), "kind": err.kind()}))
}

fn read_request(stream: &mut TcpStream, cfg: &ApiConfig) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(cfg.read_timeout))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES && !data.windows(4).any(|w| w == b"\r\n\r\n") {
            return Err(anyhow!("request headers too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };

    let mut body = data[header_end + 4..].to_vec();
    if content_length <= cfg.max_body_bytes {
        while body.len() < content_length {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(anyhow!("connection closed before end of body"));
            }
            body.extend_from_slice(&buf[..n]);
        }
        body.truncate(content_length);
    }

    Ok(HttpRequest {
        method: method.to_string(),
        path,
        content_length,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    write_response(stream, status, "application/json", body.to_string().as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        502 => "HTTP/1.1 502 Bad Gateway",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    content_length: usize,
    body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RapidwarnConfig;
    use crate::detect::{BBox, Detection, StubBackend};
    use crate::insight::MemorySink;
    use std::sync::Mutex;

    fn context(detections: Vec<Detection>) -> ApiContext {
        ApiContext {
            allow_synthetic: true,
            analyzer: Analyzer::new(RapidwarnConfig::default()),
            backend: Arc::new(Mutex::new(StubBackend::fixed(detections))),
            sink: Box::new(MemorySink::new()),
        }
    }

    fn post(path: &str, body: Value) -> HttpRequest {
        let body = body.to_string().into_bytes();
        HttpRequest {
            method: "POST".to_string(),
            path: path.to_string(),
            content_length: body.len(),
            body,
        }
    }

    fn body_of(response: &Response) -> Value {
        serde_json::from_str(&response.body).unwrap()
    }

    #[test]
    fn analyze_requires_url_and_coordinates() {
        let mut ctx = context(Vec::new());
        let r = route(&mut ctx, &post("/analyze", json!({"latitude": 1.0, "longitude": 2.0})));
        assert_eq!(r.status, 400);
        assert_eq!(body_of(&r)["error"], "Missing 'url'");

        let r = route(&mut ctx, &post("/analyze", json!({"url": "stub://a", "latitude": 1.0})));
        assert_eq!(r.status, 400);
        assert_eq!(body_of(&r)["error"], "Missing 'latitude' or 'longitude'");
    }

    #[test]
    fn analyze_returns_report_for_synthetic_media() {
        let fire = Detection::new(43, 0.7, BBox::new(0.0, 0.0, 4.0, 4.0));
        let mut ctx = context(vec![fire]);
        let r = route(
            &mut ctx,
            &post(
                "/analyze",
                json!({
                    "url": "stub://plaza?frames=4&width=32&height=32",
                    "latitude": 28.6,
                    "longitude": 77.2,
                    "input_resolution": 32
                }),
            ),
        );
        assert_eq!(r.status, 200, "{}", r.body);
        let body = body_of(&r);
        assert_eq!(body["result"], "processed");
        assert_eq!(body["insight"]["disaster_type"], "riot");
        assert_eq!(body["insight"]["fires_detected"], 4);
        assert_eq!(body["insight"]["status"], "SAFE");
        assert_eq!(body["insight"]["insight"]["type"], "riot");
    }

    #[test]
    fn invalid_override_is_a_bad_request() {
        let mut ctx = context(Vec::new());
        let r = route(
            &mut ctx,
            &post(
                "/analyze",
                json!({"url": "stub://a", "latitude": 0.0, "longitude": 0.0, "frame_stride": 0}),
            ),
        );
        assert_eq!(r.status, 400);
        assert_eq!(body_of(&r)["kind"], "invalid_request");
    }

    #[test]
    fn synthetic_locators_need_opt_in() {
        let mut ctx = context(Vec::new());
        ctx.allow_synthetic = false;
        let r = route(
            &mut ctx,
            &post(
                "/analyze",
                json!({"url": "stub://x?frames=1&width=200000&height=200000", "latitude": 0.0, "longitude": 0.0}),
            ),
        );
        assert_eq!(r.status, 400);
        assert_eq!(body_of(&r)["kind"], "invalid_request");
    }

    #[test]
    fn oversized_synthetic_source_is_rejected_when_enabled() {
        let mut ctx = context(Vec::new());
        let r = route(
            &mut ctx,
            &post(
                "/analyze",
                json!({"url": "stub://x?frames=1&width=200000&height=200000", "latitude": 0.0, "longitude": 0.0}),
            ),
        );
        assert_eq!(r.status, 500);
        assert_eq!(body_of(&r)["kind"], "source_unavailable");
    }

    #[test]
    fn huge_upscale_is_a_bad_request() {
        let mut ctx = context(Vec::new());
        let r = route(
            &mut ctx,
            &post(
                "/analyze",
                json!({"url": "stub://x?frames=1&width=64&height=48", "latitude": 0.0, "longitude": 0.0, "upscale_factor": 1.0e6}),
            ),
        );
        assert_eq!(r.status, 400);
        assert_eq!(body_of(&r)["kind"], "invalid_request");
    }

    #[test]
    fn predict_rejects_missing_path() {
        let mut ctx = context(Vec::new());
        let r = route(&mut ctx, &post("/predict", json!({"path": "/no/such/video.mp4"})));
        assert_eq!(r.status, 400);
        assert_eq!(body_of(&r)["error"], "Invalid path");
    }

    #[test]
    fn unknown_routes_and_methods() {
        let mut ctx = context(Vec::new());
        let get = |path: &str| HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            content_length: 0,
            body: Vec::new(),
        };
        assert_eq!(route(&mut ctx, &get("/")).body, BANNER);
        assert_eq!(route(&mut ctx, &get("/nope")).status, 404);
        assert_eq!(route(&mut ctx, &get("/analyze")).status, 405);
        assert_eq!(route(&mut ctx, &post("/analyze", json!("oops"))).status, 400);
    }
}
