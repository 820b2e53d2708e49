use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use rapidwarn::{FireLabel, RapidwarnConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RAPIDWARN_CONFIG",
        "RAPIDWARN_API_ADDR",
        "PORT",
        "RAPIDWARN_DETECTOR_BACKEND",
        "RAPIDWARN_MODEL_PATH",
        "RAPIDWARN_INSIGHT_URL",
        "RAPIDWARN_INSIGHT_KEY",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "api": { "addr": "0.0.0.0:9000" },
            "detector": {
                "backend": "STUB",
                "model_path": "models/crowd.onnx",
                "confidence_threshold": 0.4,
                "input_resolution": 960
            },
            "sampling": { "frame_stride": 5, "upscale_factor": 1.5 },
            "classification": { "threshold": 25, "fire_label": "fire", "fire_class": 80 },
            "insight": { "url": "https://store.example", "table": "alerts", "timeout_secs": 3 }
        }"#,
    );

    std::env::set_var("RAPIDWARN_CONFIG", file.path());
    std::env::set_var("RAPIDWARN_MODEL_PATH", "/opt/models/yolov8s.onnx");
    std::env::set_var("RAPIDWARN_INSIGHT_KEY", "service-key");

    let cfg = RapidwarnConfig::load().expect("load config");

    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.detector.backend, "stub");
    assert!(!cfg.api_allow_synthetic);
    assert_eq!(cfg.detector.model_path, PathBuf::from("/opt/models/yolov8s.onnx"));
    assert_eq!(cfg.detector.confidence_threshold, 0.4);
    assert_eq!(cfg.detector.input_resolution, 960);
    assert_eq!(cfg.sampling.frame_stride, 5);
    assert_eq!(cfg.sampling.upscale_factor, 1.5);
    assert_eq!(cfg.classification.threshold, 25);
    assert_eq!(cfg.classification.stampede_cutoff, 40);
    assert_eq!(cfg.classification.fire_label, FireLabel::Fire);
    assert_eq!(cfg.classification.classes.fire, 80);
    assert_eq!(cfg.classification.classes.person, 0);
    assert_eq!(cfg.insight.url.as_deref(), Some("https://store.example"));
    assert_eq!(cfg.insight.table, "alerts");
    assert_eq!(cfg.insight.api_key.as_deref(), Some("service-key"));
    assert_eq!(cfg.insight.timeout, Duration::from_secs(3));
    assert!(!format!("{:?}", cfg.insight).contains("service-key"));

    let policy = cfg.classification_policy();
    assert_eq!(policy.unsafe_threshold, 25);
    assert_eq!(cfg.inference_params().input_resolution, 960);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
[api]
addr = "127.0.0.1:7000"
allow_synthetic = true

[sampling]
frame_stride = 2

[fetch]
timeout_secs = 15
max_bytes = 1048576
"#,
    );
    std::env::set_var("RAPIDWARN_CONFIG", file.path());

    let cfg = RapidwarnConfig::load().expect("load toml config");
    assert_eq!(cfg.api_addr, "127.0.0.1:7000");
    assert!(cfg.api_allow_synthetic);
    assert_eq!(cfg.sampling.frame_stride, 2);
    assert_eq!(cfg.fetch.timeout, Duration::from_secs(15));
    assert_eq!(cfg.fetch.max_bytes, 1_048_576);
    assert!(cfg.insight.url.is_none());

    clear_env();
}

#[test]
fn port_rebinds_all_interfaces_and_explicit_addr_wins() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PORT", "8080");
    let cfg = RapidwarnConfig::load().expect("load with PORT");
    assert_eq!(cfg.api_addr, "0.0.0.0:8080");

    std::env::set_var("RAPIDWARN_API_ADDR", "127.0.0.1:6000");
    let cfg = RapidwarnConfig::load().expect("load with explicit addr");
    assert_eq!(cfg.api_addr, "127.0.0.1:6000");

    std::env::set_var("PORT", "not-a-port");
    assert!(RapidwarnConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for body in [
        r#"{ "detector": { "confidence_threshold": 1.5 } }"#,
        r#"{ "detector": { "input_resolution": 100 } }"#,
        r#"{ "sampling": { "frame_stride": 0 } }"#,
        r#"{ "sampling": { "upscale_factor": -1.0 } }"#,
        r#"{ "classification": { "fire_label": "smoke" } }"#,
        r#"{ "api": { "addr": "nowhere" } }"#,
        r#"{ "fetch": { "max_bytes": 0 } }"#,
        r#"{ "sampling": { "upscale_factor": 1000000.0 } }"#,
        r#"{ "detector": { "input_resolution": 1073741824 } }"#,
        r#"{ "classification": { "fire_class": 2 } }"#,
        r#"{ "classification": { "person_class": 7, "car_class": 7 } }"#,
    ] {
        let file = config_file(".json", body);
        std::env::set_var("RAPIDWARN_CONFIG", file.path());
        assert!(RapidwarnConfig::load().is_err(), "accepted {body}");
    }

    std::env::set_var("RAPIDWARN_CONFIG", "/nonexistent/rapidwarn.json");
    assert!(RapidwarnConfig::load().is_err());

    clear_env();
}

#[test]
fn api_key_is_not_read_from_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{ "insight": { "url": "https://store.example", "api_key": "leaked" } }"#,
    );
    std::env::set_var("RAPIDWARN_CONFIG", file.path());

    let cfg = RapidwarnConfig::load().expect("unknown keys are ignored");
    assert!(cfg.insight.api_key.is_none());

    clear_env();
}
