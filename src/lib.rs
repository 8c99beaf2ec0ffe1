//! Streams gesture detections from one camera to any number of TCP clients.
//!
//! - `capture`: shared camera with open retry and recovery
//! - `reco`: detector wrapper and the YOLO backend
//! - `codec`: `[u32 BE length][JSON]` framing
//! - `session` / `server`: thread-per-client detection loop
//! - `client`: receiving side

pub mod capture;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod reco;
pub mod server;
pub mod session;
pub mod stub;

pub use capture::{CameraDevice, CaptureSettings, CaptureSource, Frame, Resolution};
pub use client::{render_frame, DetectionClient};
pub use codec::{Detection, DetectionFrame, FrameDecoder, FrameReader};
pub use config::ServerConfig;
pub use error::{CaptureError, ClientError, CodecError, ServerError};
pub use reco::{DetectBackend, Detector, RawDetection};
pub use server::{DetectionServer, ServerHandle};
pub use session::{CloseReason, SessionState, SessionTable};
