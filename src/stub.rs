//! Hardware-free camera and detector.
//!
//! Used by `stub://` sources, by the `stub` detector backend and by tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};

use crate::capture::{CameraDevice, Frame, Resolution};
use crate::reco::{DetectBackend, RawDetection};

/// Shared counters so tests can observe a camera after handing it off.
#[derive(Debug, Clone, Default)]
pub struct StubCameraStats {
    opens: Arc<AtomicUsize>,
    successes: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl StubCameraStats {
    /// Open attempts, failed ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn successful_opens(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Synthetic camera producing black frames at the requested resolution.
pub struct StubCamera {
    resolution: Resolution,
    opened: bool,
    position: u64,
    open_failures: usize,
    reopen_failures: usize,
    failing_reads: HashSet<usize>,
    stats: StubCameraStats,
}

impl StubCamera {
    pub fn new() -> Self {
        Self {
            resolution: Resolution::default(),
            opened: false,
            position: 0,
            open_failures: 0,
            reopen_failures: 0,
            failing_reads: HashSet::new(),
            stats: StubCameraStats::default(),
        }
    }

    /// The first `n` open attempts fail.
    pub fn fail_opens(mut self, n: usize) -> Self {
        self.open_failures = n;
        self
    }

    /// After the first successful open, the next `n` open attempts fail.
    pub fn fail_reopens(mut self, n: usize) -> Self {
        self.reopen_failures = n;
        self
    }

    /// Read calls with these 1-based indices fail.
    pub fn fail_reads_at(mut self, indices: &[usize]) -> Self {
        self.failing_reads.extend(indices.iter().copied());
        self
    }

    pub fn stats(&self) -> StubCameraStats {
        self.stats.clone()
    }
}

impl Default for StubCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDevice for StubCamera {
    fn describe(&self) -> String {
        "stub://camera".to_string()
    }

    fn open(&mut self, resolution: Resolution) -> anyhow::Result<()> {
        let attempt = self.stats.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.open_failures {
            bail!("scripted open failure #{attempt}");
        }
        if self.stats.successful_opens() > 0 && self.reopen_failures > 0 {
            self.reopen_failures -= 1;
            bail!("scripted reopen failure at attempt #{attempt}");
        }
        self.stats.successes.fetch_add(1, Ordering::SeqCst);
        self.resolution = resolution;
        self.position = 0;
        self.opened = true;
        Ok(())
    }

    fn read(&mut self) -> anyhow::Result<Frame> {
        let index = self.stats.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.opened {
            return Err(anyhow!("device not open"));
        }
        if self.failing_reads.contains(&index) {
            bail!("scripted read failure #{index}");
        }
        self.position += 1;
        let Resolution { width, height } = self.resolution;
        Ok(Frame {
            width,
            height,
            position: self.position,
            pixels: vec![0; width as usize * height as usize * 3],
        })
    }

    fn release(&mut self) {
        if self.opened {
            self.opened = false;
            self.stats.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Detector backend returning the same boxes for every frame.
#[derive(Debug, Clone, Default)]
pub struct StubDetector {
    output: Vec<RawDetection>,
    fail: bool,
}

impl StubDetector {
    pub fn new(output: Vec<RawDetection>) -> Self {
        Self {
            output,
            fail: false,
        }
    }

    /// A backend whose every inference errors out.
    pub fn failing() -> Self {
        Self {
            output: Vec::new(),
            fail: true,
        }
    }
}

impl DetectBackend for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&self, _frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
        if self.fail {
            bail!("stub inference failure");
        }
        Ok(self.output.clone())
    }
}
