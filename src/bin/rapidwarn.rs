//! rapidwarn - analyze one video or image and print the safety report

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;

use rapidwarn::insight::{InsightSink, NullSink};
use rapidwarn::{
    AnalysisOverrides, AnalysisRequest, Analyzer, BackendRegistry, CancelToken, RapidwarnConfig,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "rapidwarn", author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample a video (or image), classify it and publish one insight
    Analyze {
        /// Local path, http(s):// url or stub:// locator.
        #[arg(long)]
        input: String,
        #[arg(long, allow_hyphen_values = true)]
        latitude: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        longitude: Option<f64>,
        /// Persons per frame above which the scene is UNSAFE.
        #[arg(long)]
        threshold: Option<u64>,
        /// Minimum detection confidence.
        #[arg(long)]
        confidence: Option<f32>,
        /// Square detector input resolution (multiple of 32).
        #[arg(long)]
        input_resolution: Option<u32>,
        /// Linear upscale applied before detection.
        #[arg(long)]
        upscale: Option<f32>,
        /// Analyze every Nth decoded frame.
        #[arg(long)]
        stride: Option<u64>,
        /// Rendered output: a video file (.mp4) or a directory for PNG frames.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Do not send the insight to the configured store.
        #[arg(long)]
        no_persist: bool,
        /// UI mode for stderr progress (auto|plain|pretty)
        #[arg(long, default_value = "auto", value_name = "MODE")]
        ui: String,
    },
    /// List the detector backends available in this build
    Backends,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = RapidwarnConfig::load()?;

    match args.command {
        Command::Backends => {
            let registry = BackendRegistry::from_settings(&config.detector)?;
            for name in registry.list() {
                let marker = if registry.default_name() == Some(name.as_str()) {
                    " (default)"
                } else {
                    ""
                };
                println!("{name}{marker}");
            }
            Ok(())
        }
        Command::Analyze {
            input,
            latitude,
            longitude,
            threshold,
            confidence,
            input_resolution,
            upscale,
            stride,
            output,
            no_persist,
            ui,
        } => {
            let is_tty = std::io::stderr().is_terminal();
            let stdout_is_tty = std::io::stdout().is_terminal();
            let ui = ui::Ui::from_args(Some(&ui), is_tty, !stdout_is_tty);

            let request = AnalysisRequest {
                locator: input,
                latitude,
                longitude,
                overrides: AnalysisOverrides {
                    threshold,
                    confidence_threshold: confidence,
                    input_resolution,
                    upscale_factor: upscale,
                    frame_stride: stride,
                    output_path: output,
                },
            };
            analyze(&ui, config, request, no_persist)
        }
    }
}

fn analyze(
    ui: &ui::Ui,
    config: RapidwarnConfig,
    request: AnalysisRequest,
    no_persist: bool,
) -> Result<()> {
    let registry = {
        let _stage = ui.stage("Load detector");
        let registry = BackendRegistry::from_settings(&config.detector)?;
        registry.with_default(|backend| backend.warm_up())??;
        registry
    };
    let mut sink: Box<dyn InsightSink> = if no_persist {
        Box::new(NullSink)
    } else {
        config.build_sink()?
    };

    let cancel = CancelToken::new();
    let flag = cancel.flag();
    ctrlc::set_handler(move || {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    let analyzer = Analyzer::new(config);
    let prepared = {
        let _stage = ui.stage("Open media");
        analyzer.prepare(&request)?
    };

    let sampled = {
        let stage = ui.frames("Sample frames", prepared.total_frames_hint());
        let result = registry.with_default(|backend| {
            prepared.sample_with_progress(backend, &cancel, &mut |n| stage.set_position(n))
        })?;
        match result {
            Ok(sampled) => sampled,
            Err(err) => {
                stage.fail();
                return Err(anyhow!(err));
            }
        }
    };

    let report = {
        let _stage = ui.stage("Publish insight");
        sampled.publish(sink.as_mut())
    };
    if !report.insight_persisted {
        log::warn!("insight was not persisted; the report below is still valid");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
