//! Error types shared across the crate.

use std::io;
use thiserror::Error;

/// Capture source failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device could not be opened within the retry budget.
    #[error("camera {device} unavailable after {attempts} attempt(s)")]
    Unavailable { device: String, attempts: u32 },

    /// A frame read failed. `generation` identifies the device instance that failed.
    #[error("frame read failed (camera generation {generation}): {reason}")]
    ReadFailure { generation: u64, reason: String },

    /// The source was released by the server.
    #[error("camera released")]
    Released,
}

/// Wire protocol failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Payload was not valid UTF-8 JSON of the expected shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON has no NaN or infinity; serde_json would emit `null`.
    #[error("frame {frame_id} carries a non-finite number")]
    NonFinite { frame_id: u64 },

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Client side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("decode error: {0}")]
    Decode(#[from] CodecError),
}

/// Server start-up failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Camera(#[from] CaptureError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
