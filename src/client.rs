use std::{
    fmt::Write as _,
    io,
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use crate::codec::{DetectionFrame, FrameReader, DEFAULT_MAX_FRAME_LEN};
use crate::error::ClientError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiving side of the detection stream. No automatic reconnection.
pub struct DetectionClient {
    stream: TcpStream,
    addr: String,
    max_frame_len: usize,
}

impl DetectionClient {
    /// Connects with a bounded timeout, then switches to blocking reads.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ClientError> {
        let addr = format!("{host}:{port}");
        let connection_error = |source: io::Error| ClientError::Connection {
            addr: addr.clone(),
            source,
        };

        let candidates = (host, port).to_socket_addrs().map_err(connection_error)?;
        let mut last_err =
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        let mut connected = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    log::debug!("connect to {} failed: {}", candidate, e);
                    last_err = e;
                }
            }
        }
        let stream = connected.ok_or_else(|| connection_error(last_err))?;
        stream.set_read_timeout(None).map_err(connection_error)?;

        log::info!("connected to {}", addr);
        Ok(Self {
            stream,
            addr,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Decodes frames until the server closes the stream, calling `on_frame`
    /// for each. Returns the number of frames consumed. A decode error ends
    /// the loop; the socket is closed either way.
    pub fn run<F>(self, mut on_frame: F) -> Result<u64, ClientError>
    where
        F: FnMut(&DetectionFrame),
    {
        let mut reader = FrameReader::new(&self.stream, self.max_frame_len);
        let mut count = 0u64;
        let result = loop {
            match reader.read_frame() {
                Ok(Some(frame)) => {
                    count += 1;
                    on_frame(&frame);
                }
                Ok(None) => break Ok(count),
                Err(e) => break Err(ClientError::Decode(e)),
            }
        };

        let _ = self.stream.shutdown(Shutdown::Both);
        match &result {
            Ok(n) => log::info!("{} closed the stream after {} frame(s)", self.addr, n),
            Err(e) => log::error!("receive from {} failed: {}", self.addr, e),
        }
        result
    }
}

/// Human readable summary of one frame.
pub fn render_frame(frame: &DetectionFrame) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "frame {}", frame.frame_id);
    let _ = writeln!(out, "{} detection(s)", frame.detections.len());
    for det in &frame.detections {
        let [cx, cy, w, h] = det.bbox;
        let _ = writeln!(out, " - {}: {:.1}%", det.class_label, det.confidence * 100.0);
        let _ = writeln!(out, "   center: ({cx:.3}, {cy:.3})");
        let _ = writeln!(out, "   size: {w:.3}x{h:.3}");
    }
    out.push_str(&"─".repeat(50));
    out
}
