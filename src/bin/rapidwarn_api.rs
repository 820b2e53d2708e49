//! rapidwarn_api - HTTP service for the analysis pipeline
//!
//! This daemon:
//! 1. Loads configuration (RAPIDWARN_CONFIG + environment)
//! 2. Loads the configured detector backend
//! 3. Serves `/analyze` and `/predict` until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use rapidwarn::{
    api::{ApiConfig, ApiServer},
    Analyzer, BackendRegistry, RapidwarnConfig,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RapidwarnConfig::load()?;
    let registry = BackendRegistry::from_settings(&config.detector)?;
    registry.with_default(|backend| backend.warm_up())??;
    let backend = registry
        .default_backend()
        .ok_or_else(|| anyhow!("no detector backend registered"))?;
    log::info!(
        "detector backend: {}",
        registry.default_name().unwrap_or("unknown")
    );
    let sink = config.build_sink()?;

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        allow_synthetic: config.api_allow_synthetic,
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, Analyzer::new(config), backend, sink).spawn()?;
    log::info!("rapidwarn_api running on http://{}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("rapidwarn_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
