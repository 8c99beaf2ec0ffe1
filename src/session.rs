//! Per-client detection loop.
//!
//! ```text
//! Starting -> Running -> (CameraRecovery -> Running)* -> Closed
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::CaptureSource;
use crate::codec::{self, DetectionFrame};
use crate::error::{CaptureError, CodecError};
use crate::reco::Detector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    CameraRecovery,
    Closed,
}

/// Live state of every session, keyed by session id.
///
/// Sessions publish each transition here; the server removes an entry once
/// the session thread has exited.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<BTreeMap<u64, SessionState>>>,
}

impl SessionTable {
    pub fn get(&self, id: u64) -> Option<SessionState> {
        self.lock().get(&id).copied()
    }

    pub fn snapshot(&self) -> Vec<(u64, SessionState)> {
        self.lock().iter().map(|(id, state)| (*id, *state)).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn set(&self, id: u64, state: SessionState) {
        self.lock().insert(id, state);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, SessionState>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why a session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Write to the client failed (broken pipe, reset, timeout).
    Disconnected(io::Error),
    /// Server shutdown was observed.
    Shutdown,
    /// Frame could not be encoded.
    Codec(CodecError),
    /// Camera recovery failed, or a read failed again right after recovery.
    Camera(CaptureError),
}

impl CloseReason {
    /// Failures the server should surface as errors rather than routine closes.
    pub fn is_escalated(&self) -> bool {
        matches!(self, CloseReason::Camera(_) | CloseReason::Codec(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Disconnected(e) => write!(f, "client disconnected: {e}"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
            CloseReason::Codec(e) => write!(f, "codec error: {e}"),
            CloseReason::Camera(e) => write!(f, "camera failure: {e}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub frame_rate: u32,
    pub max_frame_len: usize,
    pub write_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }
}

pub struct Session {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    source: Arc<CaptureSource>,
    detector: Arc<Detector>,
    running: Arc<AtomicBool>,
    config: SessionConfig,
    table: SessionTable,
    frames_sent: u64,
}

impl Session {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        source: Arc<CaptureSource>,
        detector: Arc<Detector>,
        running: Arc<AtomicBool>,
        config: SessionConfig,
        table: SessionTable,
    ) -> Self {
        table.set(id, SessionState::Starting);
        Self {
            id,
            peer,
            stream,
            source,
            detector,
            running,
            config,
            table,
            frames_sent: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.table.get(self.id).unwrap_or(SessionState::Closed)
    }

    fn transition(&self, state: SessionState) {
        log::debug!("session {} ({}): -> {:?}", self.id, self.peer, state);
        self.table.set(self.id, state);
    }

    /// Runs until the session closes and returns why.
    pub fn run(mut self) -> CloseReason {
        log::info!("session {} started for {}", self.id, self.peer);
        let reason = match self.stream.set_write_timeout(self.config.write_timeout) {
            Ok(()) => self.run_loop(),
            Err(e) => CloseReason::Disconnected(e),
        };
        self.transition(SessionState::Closed);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        log::info!(
            "session {} closed for {} after {} frame(s): {}",
            self.id,
            self.peer,
            self.frames_sent,
            reason
        );
        reason
    }

    fn run_loop(&mut self) -> CloseReason {
        let budget = self.config.frame_budget();
        let mut after_recovery = false;
        self.transition(SessionState::Running);

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return CloseReason::Shutdown;
            }
            let started = Instant::now();

            let frame = match self.source.read() {
                Ok(frame) => {
                    after_recovery = false;
                    frame
                }
                Err(CaptureError::Released) => return CloseReason::Shutdown,
                Err(err @ CaptureError::ReadFailure { .. }) if after_recovery => {
                    return CloseReason::Camera(err);
                }
                Err(CaptureError::ReadFailure { generation, reason }) => {
                    log::warn!(
                        "session {} ({}): frame read failed, reopening camera: {}",
                        self.id,
                        self.peer,
                        reason
                    );
                    self.transition(SessionState::CameraRecovery);
                    match self.source.reopen(generation) {
                        Ok(()) => {}
                        Err(CaptureError::Released) => return CloseReason::Shutdown,
                        Err(e) => return CloseReason::Camera(e),
                    }
                    self.transition(SessionState::Running);
                    after_recovery = true;
                    continue;
                }
                Err(e) => return CloseReason::Camera(e),
            };

            let detections = self.detector.detect(&frame);
            let message = DetectionFrame::new(frame.position, detections);
            match codec::write_frame(&mut self.stream, &message, self.config.max_frame_len) {
                Ok(()) => self.frames_sent += 1,
                Err(CodecError::Io(e)) => return CloseReason::Disconnected(e),
                Err(e) => return CloseReason::Codec(e),
            }

            let delay = pacing_delay(budget, started.elapsed());
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }
}

/// Time left in the frame budget; zero when processing overran it.
pub fn pacing_delay(budget: Duration, elapsed: Duration) -> Duration {
    budget.saturating_sub(elapsed)
}
