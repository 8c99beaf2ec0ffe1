//! Shared camera access.
//!
//! A single [`CaptureSource`] owns the physical device and is shared by every
//! session. Open, read and reopen are serialized behind one mutex; a
//! generation counter makes concurrent recovery reopen the device only once.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::CaptureError;

pub const DEFAULT_OPEN_ATTEMPTS: u32 = 3;
pub const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

/// One captured image, packed BGR8.
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Device frame position counter; may reset when the device is reopened.
    pub position: u64,
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("position", &self.position)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// A concrete camera backend.
pub trait CameraDevice: Send {
    /// Human readable device identifier for logs.
    fn describe(&self) -> String;

    /// Opens the device at the given resolution.
    fn open(&mut self, resolution: Resolution) -> anyhow::Result<()>;

    /// Returns the most recent frame.
    fn read(&mut self) -> anyhow::Result<Frame>;

    /// Releases the device. Must be safe to call on a closed device.
    fn release(&mut self);
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub resolution: Resolution,
    pub open_attempts: u32,
    pub open_backoff: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_backoff: DEFAULT_OPEN_BACKOFF,
        }
    }
}

struct Inner {
    device: Box<dyn CameraDevice>,
    generation: u64,
    released: bool,
}

pub struct CaptureSource {
    inner: Mutex<Inner>,
    settings: CaptureSettings,
    name: String,
}

impl CaptureSource {
    /// Opens `device` under the retry policy.
    pub fn open(
        mut device: Box<dyn CameraDevice>,
        settings: CaptureSettings,
    ) -> Result<Self, CaptureError> {
        open_with_retry(device.as_mut(), &settings)?;
        let name = device.describe();
        Ok(Self {
            inner: Mutex::new(Inner {
                device,
                generation: 0,
                released: false,
            }),
            settings,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Number of times the device has been reopened since start-up.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub fn read(&self) -> Result<Frame, CaptureError> {
        let mut inner = self.lock();
        if inner.released {
            return Err(CaptureError::Released);
        }
        let generation = inner.generation;
        inner
            .device
            .read()
            .map_err(|e| CaptureError::ReadFailure {
                generation,
                reason: format!("{e:#}"),
            })
    }

    /// Closes and reopens the device after a read failure seen at
    /// `failed_generation`. If another caller already reopened it, this is a
    /// no-op.
    pub fn reopen(&self, failed_generation: u64) -> Result<(), CaptureError> {
        let mut inner = self.lock();
        if inner.released {
            return Err(CaptureError::Released);
        }
        if inner.generation != failed_generation {
            log::debug!(
                "camera {} already recovered (generation {})",
                self.name,
                inner.generation
            );
            return Ok(());
        }

        inner.device.release();
        open_with_retry(inner.device.as_mut(), &self.settings)?;
        inner.generation += 1;
        log::info!(
            "camera {} reopened (generation {})",
            self.name,
            inner.generation
        );
        Ok(())
    }

    /// Releases the device for good. Later reads fail with `Released`.
    pub fn release(&self) {
        let mut inner = self.lock();
        if !inner.released {
            inner.device.release();
            inner.released = true;
            log::info!("camera {} released", self.name);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_with_retry(
    device: &mut dyn CameraDevice,
    settings: &CaptureSettings,
) -> Result<(), CaptureError> {
    let attempts = settings.open_attempts.max(1);
    for attempt in 1..=attempts {
        match device.open(settings.resolution) {
            Ok(()) => {
                log::info!(
                    "camera {} opened at {}x{}",
                    device.describe(),
                    settings.resolution.width,
                    settings.resolution.height
                );
                return Ok(());
            }
            Err(e) => {
                log::warn!(
                    "camera {} open failed ({}/{}): {:#}",
                    device.describe(),
                    attempt,
                    attempts,
                    e
                );
                if attempt < attempts {
                    thread::sleep(settings.open_backoff);
                }
            }
        }
    }
    Err(CaptureError::Unavailable {
        device: device.describe(),
        attempts,
    })
}

/// Builds a device from a source string: `stub://`, a device index or path
/// (OpenCV), or an `http(s)://` snapshot URL.
pub fn device_from_uri(uri: &str) -> anyhow::Result<Box<dyn CameraDevice>> {
    if uri.starts_with("stub://") {
        return Ok(Box::new(crate::stub::StubCamera::new()));
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        #[cfg(feature = "http-camera")]
        return Ok(Box::new(http::SnapshotCamera::new(uri)));
        #[cfg(not(feature = "http-camera"))]
        anyhow::bail!("{uri}: built without the `http-camera` feature");
    }

    #[cfg(feature = "opencv")]
    return Ok(Box::new(video::VideoCamera::new(uri)));
    #[cfg(not(feature = "opencv"))]
    anyhow::bail!("{uri}: built without the `opencv` feature")
}

/// Parses `0` or `/dev/video0` into a device index.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse().ok();
    }
    None
}

#[cfg(feature = "opencv")]
pub mod video {
    use anyhow::{anyhow, bail};
    use opencv::{
        core::Mat,
        prelude::*,
        videoio::{self, VideoCapture},
    };

    use super::{parse_device_index, CameraDevice, Frame, Resolution};

    /// OpenCV `VideoCapture` by index or path.
    pub struct VideoCamera {
        uri: String,
        cap: Option<VideoCapture>,
        frame: Mat,
    }

    impl VideoCamera {
        pub fn new(uri: &str) -> Self {
            Self {
                uri: uri.to_string(),
                cap: None,
                frame: Mat::default(),
            }
        }
    }

    impl CameraDevice for VideoCamera {
        fn describe(&self) -> String {
            self.uri.clone()
        }

        fn open(&mut self, resolution: Resolution) -> anyhow::Result<()> {
            let mut cap = match parse_device_index(&self.uri) {
                Some(index) => VideoCapture::new(index, videoio::CAP_ANY)?,
                None => VideoCapture::from_file(&self.uri, videoio::CAP_ANY)?,
            };
            if !cap.is_opened()? {
                bail!("device not opened");
            }
            cap.set(videoio::CAP_PROP_FRAME_WIDTH, resolution.width as f64)?;
            cap.set(videoio::CAP_PROP_FRAME_HEIGHT, resolution.height as f64)?;
            self.cap = Some(cap);
            Ok(())
        }

        fn read(&mut self) -> anyhow::Result<Frame> {
            let cap = self.cap.as_mut().ok_or_else(|| anyhow!("device not open"))?;
            if !cap.read(&mut self.frame)? {
                bail!("no frame returned");
            }
            let size = self.frame.size()?;
            if size.width <= 0 {
                bail!("empty frame");
            }
            let position = cap.get(videoio::CAP_PROP_POS_FRAMES)?.max(0.0) as u64;
            Ok(Frame {
                width: size.width as u32,
                height: size.height as u32,
                position,
                pixels: self.frame.data_bytes()?.to_vec(),
            })
        }

        fn release(&mut self) {
            if let Some(mut cap) = self.cap.take() {
                if let Err(e) = cap.release() {
                    log::warn!("camera {} release failed: {}", self.uri, e);
                }
            }
        }
    }
}

#[cfg(feature = "http-camera")]
pub mod http {
    use anyhow::{anyhow, Context};

    use super::{CameraDevice, Frame, Resolution};

    pub fn get_image_as_bytes(
        client: &reqwest::blocking::Client,
        url: &str,
    ) -> anyhow::Result<Vec<u8>> {
        Ok(client
            .get(url)
            .send()?
            .error_for_status()?
            .bytes()?
            .into())
    }

    /// Camera that serves one JPEG snapshot per HTTP GET.
    pub struct SnapshotCamera {
        url: String,
        client: Option<reqwest::blocking::Client>,
        resolution: Resolution,
        position: u64,
    }

    impl SnapshotCamera {
        pub fn new(url: &str) -> Self {
            Self {
                url: url.to_string(),
                client: None,
                resolution: Resolution::default(),
                position: 0,
            }
        }
    }

    impl CameraDevice for SnapshotCamera {
        fn describe(&self) -> String {
            self.url.clone()
        }

        fn open(&mut self, resolution: Resolution) -> anyhow::Result<()> {
            let client = reqwest::blocking::Client::new();
            get_image_as_bytes(&client, &self.url).context("snapshot fetch")?;
            self.client = Some(client);
            self.resolution = resolution;
            self.position = 0;
            Ok(())
        }

        fn read(&mut self) -> anyhow::Result<Frame> {
            let client = self.client.as_ref().ok_or_else(|| anyhow!("device not open"))?;
            let bytes = get_image_as_bytes(client, &self.url)?;
            let mut rgb = image::load_from_memory(&bytes)?.to_rgb8();
            if rgb.width() != self.resolution.width || rgb.height() != self.resolution.height {
                log::trace!(
                    "snapshot is {}x{}, requested {}x{}",
                    rgb.width(),
                    rgb.height(),
                    self.resolution.width,
                    self.resolution.height
                );
            }
            // BGR like every other source
            for px in rgb.pixels_mut() {
                px.0.swap(0, 2);
            }
            self.position += 1;
            Ok(Frame {
                width: rgb.width(),
                height: rgb.height(),
                position: self.position,
                pixels: rgb.into_raw(),
            })
        }

        fn release(&mut self) {
            self.client = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubCamera;

    fn fast() -> CaptureSettings {
        CaptureSettings {
            open_backoff: Duration::from_millis(1),
            ..CaptureSettings::default()
        }
    }

    #[test]
    fn open_retries_then_succeeds() {
        let camera = StubCamera::new().fail_opens(2);
        let stats = camera.stats();
        let source = CaptureSource::open(Box::new(camera), fast()).unwrap();
        assert_eq!(stats.opens(), 3);
        assert_eq!(source.generation(), 0);
        let frame = source.read().unwrap();
        assert_eq!((frame.width, frame.height), (640, 480));
    }

    #[test]
    fn open_gives_up_after_attempts() {
        let camera = StubCamera::new().fail_opens(3);
        let stats = camera.stats();
        let err = CaptureSource::open(Box::new(camera), fast()).err().unwrap();
        assert!(matches!(err, CaptureError::Unavailable { attempts: 3, .. }));
        assert_eq!(stats.opens(), 3);
    }

    #[test]
    fn reopen_is_shared_across_callers() {
        let camera = StubCamera::new().fail_reads_at(&[1]);
        let stats = camera.stats();
        let source = CaptureSource::open(Box::new(camera), fast()).unwrap();

        let generation = match source.read() {
            Err(CaptureError::ReadFailure { generation, .. }) => generation,
            other => panic!("expected read failure, got {other:?}"),
        };
        source.reopen(generation).unwrap();
        // a second session that saw the same failure must not reopen again
        source.reopen(generation).unwrap();

        assert_eq!(stats.opens(), 2);
        assert_eq!(stats.releases(), 1);
        assert_eq!(source.generation(), 1);
        assert_eq!(source.read().unwrap().position, 1);
    }

    #[test]
    fn released_source_refuses_reads() {
        let source = CaptureSource::open(Box::new(StubCamera::new()), fast()).unwrap();
        source.release();
        assert!(source.is_released());
        assert!(matches!(source.read(), Err(CaptureError::Released)));
        assert!(matches!(source.reopen(0), Err(CaptureError::Released)));
    }

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam"), None);
    }
}
