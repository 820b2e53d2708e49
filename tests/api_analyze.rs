use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

use rapidwarn::api::{ApiConfig, ApiHandle, ApiServer, BANNER};
use rapidwarn::{
    Analyzer, BBox, Detection, Insight, InsightSink, RapidwarnConfig, SharedBackend, StubBackend,
};

#[derive(Clone, Default)]
struct SharedSink {
    records: Arc<Mutex<Vec<Insight>>>,
    fail: bool,
}

impl InsightSink for SharedSink {
    fn name(&self) -> &'static str {
        "shared"
    }

    fn persist(&mut self, insight: &Insight) -> Result<()> {
        if self.fail {
            return Err(anyhow!("store offline"));
        }
        self.records.lock().unwrap().push(insight.clone());
        Ok(())
    }
}

struct TestApi {
    api_handle: Option<ApiHandle>,
    sink: SharedSink,
}

impl TestApi {
    fn new(detections: Vec<Detection>, failing_sink: bool) -> Result<Self> {
        let backend: SharedBackend = Arc::new(Mutex::new(StubBackend::fixed(detections)));
        let sink = SharedSink {
            fail: failing_sink,
            ..SharedSink::default()
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            allow_synthetic: true,
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(
            api_config,
            Analyzer::new(RapidwarnConfig::default()),
            backend,
            Box::new(sink.clone()),
        )
        .spawn()?;
        Ok(Self {
            api_handle: Some(api_handle),
            sink,
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn send(&self, request: &str) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn post(&self, path: &str, body: &Value) -> Result<(String, Value)> {
        let body = body.to_string();
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (headers, body) = self.send(&request)?;
        Ok((headers, serde_json::from_str(&body)?))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn crowd(persons: usize) -> Vec<Detection> {
    (0..persons)
        .map(|i| {
            let x = (i % 8) as f32 * 4.0;
            Detection::new(0, 0.8, BBox::new(x, 0.0, x + 3.0, 6.0))
        })
        .collect()
}

#[test]
fn api_health_and_banner() -> Result<()> {
    let api = TestApi::new(Vec::new(), false)?;

    let (headers, body) = api.send("GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    assert!(body.contains(r#""status":"ok""#));

    let (headers, body) = api.send("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, BANNER);

    Ok(())
}

#[test]
fn analyze_persists_one_insight_and_returns_report() -> Result<()> {
    let api = TestApi::new(crowd(45), false)?;

    let (headers, body) = api.post(
        "/analyze",
        &json!({
            "url": "stub://stadium?frames=9&width=32&height=32",
            "latitude": 12.97,
            "longitude": 77.59,
            "frame_stride": 3,
            "input_resolution": 32
        }),
    )?;
    assert!(headers.contains("200 OK"), "{headers} {body}");
    assert_eq!(body["result"], "processed");
    let report = &body["insight"];
    assert_eq!(report["disaster_type"], "stampede");
    assert_eq!(report["status"], "UNSAFE");
    assert_eq!(report["max_persons"], 45);
    assert_eq!(report["processed_frames"], 3);
    assert_eq!(report["total_frames"], 9);
    assert_eq!(report["insight_persisted"], true);

    let records = api.sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].latitude, Some(12.97));
    assert_eq!(records[0].longitude, Some(77.59));
    assert!(records[0].location.is_none());

    Ok(())
}

#[test]
fn failing_sink_does_not_change_the_result() -> Result<()> {
    let request = json!({
        "url": "stub://plaza?frames=4&width=32&height=32",
        "latitude": 0.0,
        "longitude": 0.0,
        "input_resolution": 32
    });

    let healthy = TestApi::new(crowd(31), false)?;
    let (_, ok_body) = healthy.post("/analyze", &request)?;
    let broken = TestApi::new(crowd(31), true)?;
    let (headers, failed_body) = broken.post("/analyze", &request)?;

    assert!(headers.contains("200 OK"));
    assert_eq!(failed_body["insight"]["insight_persisted"], false);
    for key in ["disaster_type", "status", "max_persons", "processed_frames"] {
        assert_eq!(ok_body["insight"][key], failed_body["insight"][key], "{key}");
    }
    assert_eq!(failed_body["insight"]["status"], "UNSAFE");
    assert!(broken.sink.records.lock().unwrap().is_empty());

    Ok(())
}

#[test]
fn analyze_validates_request() -> Result<()> {
    let api = TestApi::new(Vec::new(), false)?;

    let (headers, body) = api.post("/analyze", &json!({"latitude": 1.0, "longitude": 1.0}))?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "Missing 'url'");

    let (headers, body) = api.post("/analyze", &json!({"url": "stub://x", "longitude": 1.0}))?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "Missing 'latitude' or 'longitude'");

    Ok(())
}

#[test]
fn unreachable_download_is_bad_gateway() -> Result<()> {
    let api = TestApi::new(Vec::new(), false)?;

    let (headers, body) = api.post(
        "/analyze",
        &json!({"url": "http://127.0.0.1:9/clip.mp4", "latitude": 1.0, "longitude": 1.0}),
    )?;
    assert!(headers.contains("502 Bad Gateway"));
    assert!(body["error"]
        .as_str()
        .unwrap_or_default()
        .starts_with("Download failed"));
    assert!(api.sink.records.lock().unwrap().is_empty());

    Ok(())
}

/// Serves `body` once with a 200 and returns the url it is reachable at.
fn serve_once(path: &str, body: &'static [u8]) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}/{path}", listener.local_addr()?);
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = Vec::new();
            let mut buf = [0u8; 512];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: video/mp4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(body);
        }
    });
    Ok(url)
}

#[test]
fn undecodable_download_is_internal_error() -> Result<()> {
    let api = TestApi::new(Vec::new(), false)?;
    let url = serve_once("clip.mp4", b"this is not a video container")?;

    let (headers, body) = api.post(
        "/analyze",
        &json!({"url": url, "latitude": 1.0, "longitude": 1.0}),
    )?;
    assert!(headers.contains("500 Internal Server Error"), "{headers} {body}");
    assert_eq!(body["kind"], "source_unavailable");
    assert!(!body["error"]
        .as_str()
        .unwrap_or_default()
        .starts_with("Download failed"));
    assert!(api.sink.records.lock().unwrap().is_empty());

    Ok(())
}

#[test]
fn synthetic_sources_are_off_by_default() -> Result<()> {
    let api_handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        Analyzer::new(RapidwarnConfig::default()),
        Arc::new(Mutex::new(StubBackend::new())),
        Box::new(SharedSink::default()),
    )
    .spawn()?;
    let api = TestApi {
        api_handle: Some(api_handle),
        sink: SharedSink::default(),
    };

    let (headers, body) = api.post(
        "/analyze",
        &json!({"url": "stub://x?frames=18446744073709551615", "latitude": 0.0, "longitude": 0.0}),
    )?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["kind"], "invalid_request");

    Ok(())
}

#[test]
fn predict_renders_local_image() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let image_path = dir.path().join("street.png");
    image::RgbImage::from_pixel(40, 30, image::Rgb([90, 90, 90])).save(&image_path)?;
    let out_dir = dir.path().join("rendered");

    let api = TestApi::new(crowd(2), false)?;
    let (headers, body) = api.post(
        "/predict",
        &json!({
            "path": image_path,
            "output_path": out_dir,
            "input_resolution": 32,
            "frame_stride": 5
        }),
    )?;
    assert!(headers.contains("200 OK"), "{headers} {body}");
    assert_eq!(body["result"], "Video processed");
    assert_eq!(body["output_file"], json!(out_dir));
    // Still images are always sampled, whatever the stride.
    assert_eq!(body["report"]["processed_frames"], 1);
    assert!(out_dir.join("frame_000001.png").is_file());

    let (headers, body) = api.post("/predict", &json!({"path": "/missing/video.mp4"}))?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "Invalid path");

    Ok(())
}

#[test]
fn oversized_body_is_rejected() -> Result<()> {
    let api = TestApi::new(Vec::new(), false)?;
    let request = "POST /analyze HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1000000\r\n\r\n";
    let (headers, _body) = api.send(request)?;
    assert!(headers.contains("413 Payload Too Large"));
    Ok(())
}
