use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{CaptureSettings, Resolution, DEFAULT_OPEN_ATTEMPTS};
use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::reco::{gesture_classes, load_class_list, CONFIDENCE_THRESHOLD};
use crate::session::SessionConfig;

pub const DEFAULT_PORT: u16 = 65432;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:65432";
const DEFAULT_CAMERA: &str = "0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_OPEN_BACKOFF_MS: u64 = 1000;
const DEFAULT_MODEL: &str = "model/best.onnx";
const DEFAULT_FRAME_RATE: u32 = 30;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServerConfigFile {
    listen_addr: Option<String>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    open_attempts: Option<u32>,
    open_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<DetectorBackendKind>,
    model: Option<PathBuf>,
    class_file: Option<PathBuf>,
    classes: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    frame_rate: Option<u32>,
    max_frame_len: Option<usize>,
    write_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackendKind {
    Yolo,
    Stub,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// `0`, `/dev/video0`, `stub://...` or an `http(s)://` snapshot URL.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub open_attempts: u32,
    pub open_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorBackendKind,
    pub model: PathBuf,
    pub classes: Vec<String>,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub frame_rate: u32,
    pub max_frame_len: usize,
    pub write_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            camera: CameraSettings {
                source: DEFAULT_CAMERA.to_string(),
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                open_attempts: DEFAULT_OPEN_ATTEMPTS,
                open_backoff: Duration::from_millis(DEFAULT_OPEN_BACKOFF_MS),
            },
            detector: DetectorSettings {
                backend: DetectorBackendKind::Yolo,
                model: PathBuf::from(DEFAULT_MODEL),
                classes: gesture_classes(),
                confidence_threshold: CONFIDENCE_THRESHOLD,
            },
            stream: StreamSettings {
                frame_rate: DEFAULT_FRAME_RATE,
                max_frame_len: DEFAULT_MAX_FRAME_LEN,
                write_timeout: None,
            },
        }
    }
}

impl ServerConfig {
    /// Defaults, then the TOML file named by `RECO_CONFIG`, then `RECO_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("RECO_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ServerConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            resolution: Resolution::new(self.camera.width, self.camera.height),
            open_attempts: self.camera.open_attempts,
            open_backoff: self.camera.open_backoff,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            frame_rate: self.stream.frame_rate,
            max_frame_len: self.stream.max_frame_len,
            write_timeout: self.stream.write_timeout,
        }
    }

    fn from_file(file: ServerConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(addr) = file.listen_addr {
            cfg.listen_addr = addr;
        }

        let camera = file.camera.unwrap_or_default();
        if let Some(source) = camera.source {
            cfg.camera.source = source;
        }
        cfg.camera.width = camera.width.unwrap_or(cfg.camera.width);
        cfg.camera.height = camera.height.unwrap_or(cfg.camera.height);
        cfg.camera.open_attempts = camera.open_attempts.unwrap_or(cfg.camera.open_attempts);
        if let Some(ms) = camera.open_backoff_ms {
            cfg.camera.open_backoff = Duration::from_millis(ms);
        }

        let detector = file.detector.unwrap_or_default();
        cfg.detector.backend = detector.backend.unwrap_or(cfg.detector.backend);
        if let Some(model) = detector.model {
            cfg.detector.model = model;
        }
        match (detector.class_file, detector.classes) {
            (Some(_), Some(_)) => {
                return Err(anyhow!(
                    "detector.class_file and detector.classes are mutually exclusive"
                ))
            }
            (Some(path), None) => {
                cfg.detector.classes = load_class_list(&path)
                    .with_context(|| format!("failed to read class file {}", path.display()))?;
            }
            (None, Some(classes)) => cfg.detector.classes = classes,
            (None, None) => {}
        }
        cfg.detector.confidence_threshold = detector
            .confidence_threshold
            .unwrap_or(cfg.detector.confidence_threshold);

        let stream = file.stream.unwrap_or_default();
        cfg.stream.frame_rate = stream.frame_rate.unwrap_or(cfg.stream.frame_rate);
        cfg.stream.max_frame_len = stream.max_frame_len.unwrap_or(cfg.stream.max_frame_len);
        cfg.stream.write_timeout = stream
            .write_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("RECO_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }
        if let Ok(source) = std::env::var("RECO_CAMERA") {
            if !source.trim().is_empty() {
                self.camera.source = source;
            }
        }
        if let Ok(model) = std::env::var("RECO_MODEL") {
            if !model.trim().is_empty() {
                self.detector.model = PathBuf::from(model);
            }
        }
        if let Ok(rate) = std::env::var("RECO_FRAME_RATE") {
            self.stream.frame_rate = rate
                .trim()
                .parse()
                .map_err(|_| anyhow!("RECO_FRAME_RATE must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.stream.frame_rate == 0 {
            return Err(anyhow!("stream.frame_rate must be greater than zero"));
        }
        if self.camera.open_attempts == 0 {
            return Err(anyhow!("camera.open_attempts must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera resolution must be non-zero"));
        }
        if self.detector.classes.is_empty() {
            return Err(anyhow!("detector class table is empty"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("detector.confidence_threshold must be within [0, 1]"));
        }
        if self.stream.max_frame_len == 0 {
            return Err(anyhow!("stream.max_frame_len must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ServerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
