use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use reco_stream::{
    capture::device_from_uri,
    config::{DetectorBackendKind, ServerConfig},
    reco::{DetectBackend, Detector},
    stub::StubDetector,
    DetectionServer,
};

/// Streams gesture detections to TCP clients.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// TOML config file.
    #[arg(long, env = "RECO_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Camera source: device index, path, stub:// or http(s):// snapshot URL.
    #[arg(long)]
    camera: Option<String>,

    /// ONNX model path.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Use the stub detector instead of the model.
    #[arg(long)]
    stub_detector: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServerConfig::load_from(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(camera) = args.camera {
        config.camera.source = camera;
    }
    if let Some(model) = args.model {
        config.detector.model = model;
    }
    if args.stub_detector {
        config.detector.backend = DetectorBackendKind::Stub;
    }

    let device = device_from_uri(&config.camera.source)?;
    let detector = Detector::new(
        load_backend(&config)?,
        config.detector.classes.clone(),
        config.detector.confidence_threshold,
    );

    let server = DetectionServer::new(&config, device, detector)?;
    let handle = server.handle();
    ctrlc::set_handler(move || handle.stop()).context("failed to install Ctrl-C handler")?;

    server.start()?;
    Ok(())
}

fn load_backend(config: &ServerConfig) -> anyhow::Result<Box<dyn DetectBackend>> {
    match config.detector.backend {
        DetectorBackendKind::Stub => Ok(Box::new(StubDetector::default())),
        DetectorBackendKind::Yolo => load_yolo(config),
    }
}

#[cfg(feature = "opencv")]
fn load_yolo(config: &ServerConfig) -> anyhow::Result<Box<dyn DetectBackend>> {
    let model = config.detector.model.to_string_lossy();
    let yolo = reco_stream::reco::Yolo::new(
        &model,
        config.detector.classes.len(),
        config.detector.confidence_threshold,
    )
    .with_context(|| format!("failed to load model {model}"))?;
    Ok(Box::new(yolo))
}

#[cfg(not(feature = "opencv"))]
fn load_yolo(config: &ServerConfig) -> anyhow::Result<Box<dyn DetectBackend>> {
    anyhow::bail!(
        "cannot load {}: built without the `opencv` feature (use --stub-detector)",
        config.detector.model.display()
    )
}
