use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::capture::{CameraDevice, CaptureSource};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::reco::Detector;
use crate::session::{Session, SessionConfig, SessionState, SessionTable};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts clients and runs one [`Session`] thread per connection, all
/// sharing one camera and one detector.
pub struct DetectionServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    source: Arc<CaptureSource>,
    detector: Arc<Detector>,
    session_config: SessionConfig,
    running: Arc<AtomicBool>,
    sessions: SessionTable,
}

/// Cloneable control handle for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    source: Arc<CaptureSource>,
    running: Arc<AtomicBool>,
    sessions: SessionTable,
}

impl DetectionServer {
    /// Binds the listening socket and opens the camera. Failing to open the
    /// camera aborts start-up.
    pub fn new(
        config: &ServerConfig,
        device: Box<dyn CameraDevice>,
        detector: Detector,
    ) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(config.listen_addr.as_str()).map_err(|source| ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let source = CaptureSource::open(device, config.capture_settings()).map_err(|e| {
            log::error!("camera failed to open, aborting start-up: {}", e);
            e
        })?;

        log::info!(
            "detector {} loaded with {} classes",
            detector.backend_name(),
            detector.class_list().len()
        );

        Ok(DetectionServer {
            listener,
            local_addr,
            source: Arc::new(source),
            detector: Arc::new(detector),
            session_config: config.session_config(),
            running: Arc::new(AtomicBool::new(true)),
            sessions: SessionTable::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            local_addr: self.local_addr,
            source: self.source.clone(),
            running: self.running.clone(),
            sessions: self.sessions.clone(),
        }
    }

    /// Accept loop. Returns once [`ServerHandle::stop`] is called; the
    /// listening socket is closed on return.
    pub fn start(self) -> Result<(), ServerError> {
        log::info!("serving detections on {}", self.local_addr);
        let mut next_id: u64 = 0;

        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(client) => {
                    next_id += 1;
                    self.spawn_session(next_id, client);
                }
                Err(e) => {
                    let delay = accept_retry_delay(&e);
                    log::warn!("accept failed: {} (retrying in {:?})", e, delay);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }

        self.handle().stop();
        log::info!("server on {} stopped", self.local_addr);
        Ok(())
    }

    // priv
    fn spawn_session(&self, id: u64, client: TcpStream) {
        let peer = match client.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("dropping connection without peer address: {}", e);
                return;
            }
        };
        log::info!("client connected: {} (session {})", peer, id);

        let session = Session::new(
            id,
            peer,
            client,
            self.source.clone(),
            self.detector.clone(),
            self.running.clone(),
            self.session_config.clone(),
            self.sessions.clone(),
        );
        let sessions = self.sessions.clone();

        let spawned = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                let reason = session.run();
                if reason.is_escalated() {
                    log::error!("session {} ({}) failed: {}", id, peer, reason);
                }
                sessions.remove(id);
            });
        if let Err(e) = spawned {
            self.sessions.remove(id);
            log::error!("failed to spawn session {} for {}: {}", id, peer, e);
        }
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sessions whose threads have not yet exited.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Current state of each live session, ordered by session id.
    pub fn session_states(&self) -> Vec<(u64, SessionState)> {
        self.sessions.snapshot()
    }

    /// Best-effort shutdown: stop accepting and release the camera.
    /// Sessions notice on their next iteration; they are not joined.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("stopping server on {}", self.local_addr);
        self.source.release();

        // unblock accept()
        let wake = wake_addr(self.local_addr);
        if let Err(e) = TcpStream::connect_timeout(&wake, WAKE_TIMEOUT) {
            log::debug!("wake-up connection to {} failed: {}", wake, e);
        }
    }
}

/// Per-connection failures retry at once; anything else (EMFILE, ENOBUFS, ...)
/// tends to persist, so back off instead of spinning.
fn accept_retry_delay(err: &io::Error) -> Duration {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}
