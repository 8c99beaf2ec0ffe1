//! Length-prefixed JSON framing.
//!
//! Every message on the wire is a 4-byte big-endian payload length followed by
//! that many bytes of UTF-8 JSON:
//!
//! ```text
//! [len: u32 BE][{"frame_id": .., "detections": [..]}]
//! ```

use std::io::{ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub const HEADER_LEN: usize = 4;
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One recognized object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub confidence: f64,
    /// (center_x, center_y, width, height), normalized to the frame size.
    pub bbox: [f64; 4],
}

/// One message unit sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFrame {
    pub frame_id: u64,
    pub detections: Vec<Detection>,
}

impl DetectionFrame {
    pub fn new(frame_id: u64, detections: Vec<Detection>) -> Self {
        Self {
            frame_id,
            detections,
        }
    }

    fn is_finite(&self) -> bool {
        self.detections
            .iter()
            .all(|d| d.confidence.is_finite() && d.bbox.iter().all(|v| v.is_finite()))
    }
}

/// Serializes `frame` and prepends the length header.
pub fn encode(frame: &DetectionFrame, max_frame_len: usize) -> Result<Vec<u8>, CodecError> {
    if !frame.is_finite() {
        return Err(CodecError::NonFinite {
            frame_id: frame.frame_id,
        });
    }
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > max_frame_len || payload.len() > u32::MAX as usize {
        return Err(CodecError::FrameTooLarge {
            len: payload.len(),
            max: max_frame_len,
        });
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encodes `frame` and emits it with a single `write_all`.
pub fn write_frame<W: Write>(
    writer: &mut W,
    frame: &DetectionFrame,
    max_frame_len: usize,
) -> Result<(), CodecError> {
    let bytes = encode(frame, max_frame_len)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Push-based decoder: feed it arbitrary chunks, pull complete frames out.
///
/// A decode error leaves the decoder in an unusable state; the connection
/// should be dropped. There is no resynchronization.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<DetectionFrame>, CodecError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let frame = serde_json::from_slice(&self.buf[HEADER_LEN..HEADER_LEN + len])?;
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(frame))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

/// Pull-based reader over any byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_len),
            chunk: vec![0; 8192],
        }
    }

    /// Reads until a full frame is available.
    ///
    /// `Ok(None)` means the peer closed the stream, including mid-frame.
    pub fn read_frame(&mut self) -> Result<Option<DetectionFrame>, CodecError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            let n = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if self.decoder.pending() > 0 {
                    log::debug!(
                        "stream closed with {} byte(s) of a partial frame",
                        self.decoder.pending()
                    );
                }
                return Ok(None);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most one byte per `read` call.
    struct Trickle<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    fn sample() -> DetectionFrame {
        DetectionFrame::new(
            42,
            vec![
                Detection {
                    class_label: "静音".to_string(),
                    confidence: 0.9123,
                    bbox: [0.5, 0.5, 0.2, 0.3],
                },
                Detection {
                    class_label: "暂停".to_string(),
                    confidence: 0.61,
                    bbox: [0.125, 0.9, 0.05, 0.1],
                },
            ],
        )
    }

    #[test]
    fn header_is_big_endian_payload_length() {
        let bytes = encode(&sample(), DEFAULT_MAX_FRAME_LEN).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - HEADER_LEN);
        let json: serde_json::Value = serde_json::from_slice(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(json["detections"][0]["class"], "静音");
    }

    #[test]
    fn decoded_frame_equals_encoded_frame() {
        let frame = sample();
        let bytes = encode(&frame, DEFAULT_MAX_FRAME_LEN).unwrap();
        let mut reader = FrameReader::new(Cursor::new(bytes), DEFAULT_MAX_FRAME_LEN);
        assert_eq!(reader.read_frame().unwrap(), Some(frame));
        assert_eq!(reader.read_frame().unwrap(), None);
    }

    #[test]
    fn byte_at_a_time_matches_bulk_decode() {
        let mut bytes = encode(&sample(), DEFAULT_MAX_FRAME_LEN).unwrap();
        bytes.extend(encode(&DetectionFrame::new(43, vec![]), DEFAULT_MAX_FRAME_LEN).unwrap());

        let mut bulk = FrameReader::new(Cursor::new(bytes.clone()), DEFAULT_MAX_FRAME_LEN);
        let mut trickle = FrameReader::new(
            Trickle {
                data: &bytes,
                pos: 0,
            },
            DEFAULT_MAX_FRAME_LEN,
        );
        for _ in 0..2 {
            let a = bulk.read_frame().unwrap();
            let b = trickle.read_frame().unwrap();
            assert!(a.is_some());
            assert_eq!(a, b);
        }
        assert_eq!(trickle.read_frame().unwrap(), None);
    }

    #[test]
    fn empty_detections_are_an_empty_array() {
        let bytes = encode(&DetectionFrame::new(0, vec![]), DEFAULT_MAX_FRAME_LEN).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(json["detections"], serde_json::json!([]));

        let mut decoder = FrameDecoder::default();
        decoder.push(&bytes);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.detections.is_empty());
    }

    #[test]
    fn truncated_stream_is_end_of_stream() {
        let bytes = encode(&sample(), DEFAULT_MAX_FRAME_LEN).unwrap();

        let mut header_only = FrameReader::new(Cursor::new(bytes[..2].to_vec()), 1024);
        assert_eq!(header_only.read_frame().unwrap(), None);

        let cut = bytes.len() - 3;
        let mut body_cut = FrameReader::new(Cursor::new(bytes[..cut].to_vec()), 1024);
        assert_eq!(body_cut.read_frame().unwrap(), None);
    }

    #[test]
    fn malformed_payload_is_fatal() {
        let mut bytes = 5u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{nope");
        let mut reader = FrameReader::new(Cursor::new(bytes), DEFAULT_MAX_FRAME_LEN);
        assert!(matches!(reader.read_frame(), Err(CodecError::Json(_))));
    }

    #[test]
    fn non_finite_numbers_are_not_encoded() {
        let mut frame = sample();
        frame.detections[0].confidence = f64::NAN;
        assert!(matches!(
            encode(&frame, DEFAULT_MAX_FRAME_LEN),
            Err(CodecError::NonFinite { frame_id: 42 })
        ));

        let mut frame = sample();
        frame.detections[1].bbox[2] = f64::INFINITY;
        let mut sink = Vec::new();
        assert!(write_frame(&mut sink, &frame, DEFAULT_MAX_FRAME_LEN).is_err());
        assert!(sink.is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let frame = sample();
        assert!(matches!(
            encode(&frame, 8),
            Err(CodecError::FrameTooLarge { max: 8, .. })
        ));

        let mut decoder = FrameDecoder::new(8);
        decoder.push(&1024u32.to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(CodecError::FrameTooLarge { len: 1024, max: 8 })
        ));
    }
}
