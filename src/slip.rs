/// SLIP-style framing used by the sniffer's UART protocol.
///
/// Every frame is `START payload END`. Marker bytes inside the payload are
/// replaced by `ESC` followed by a substitute:
///
/// | literal | encoded          |
/// |---------|------------------|
/// | `0xAB`  | `0xCD 0xAC`      |
/// | `0xBC`  | `0xCD 0xBD`      |
/// | `0xCD`  | `0xCD 0xCE`      |
use std::time::{Duration, Instant};

use crate::error::FrameError;
use crate::transport::ByteSource;

pub const SLIP_START: u8 = 0xAB;
pub const SLIP_END: u8 = 0xBC;
pub const SLIP_ESC: u8 = 0xCD;
pub const SLIP_ESC_START: u8 = 0xAC;
pub const SLIP_ESC_END: u8 = 0xBD;
pub const SLIP_ESC_ESC: u8 = 0xCE;

/// Encode `payload` as one complete frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(SLIP_START);
    for &byte in payload {
        match byte {
            SLIP_START => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_START]),
            SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            _ => out.push(byte),
        }
    }
    out.push(SLIP_END);
    out
}

/// Reassembles frames from a byte source.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    /// How long to wait for a start-of-frame marker.
    pub byte_timeout: Duration,
    /// How long a started frame may take to complete.
    pub complete_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            byte_timeout: Duration::from_millis(crate::defaults::BYTE_TIMEOUT_MS),
            complete_timeout: Duration::from_millis(crate::defaults::COMPLETE_TIMEOUT_MS),
            max_frame_len: crate::defaults::MAX_FRAME_LEN,
        }
    }
}

impl FrameDecoder {
    pub fn new(byte_timeout: Duration, complete_timeout: Duration, max_frame_len: usize) -> Self {
        Self {
            byte_timeout,
            complete_timeout,
            max_frame_len,
        }
    }

    /// Read one frame and return its unescaped payload.
    ///
    /// Bytes before the start marker are discarded. Every error leaves the
    /// source positioned so the next call resynchronizes on the next start
    /// marker.
    pub fn decode<S: ByteSource + ?Sized>(&self, source: &S) -> Result<Vec<u8>, FrameError> {
        self.await_start(source)?;

        let deadline = Instant::now() + self.complete_timeout;
        let mut frame = Vec::new();
        let mut escaped = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(byte) = source.read_byte(Some(remaining)) else {
                if !source.is_open() {
                    return Err(FrameError::TransportClosed);
                }
                return Err(FrameError::IncompletePacket {
                    received: frame.len(),
                });
            };

            if escaped {
                escaped = false;
                let literal = match byte {
                    SLIP_ESC_START => SLIP_START,
                    SLIP_ESC_END => SLIP_END,
                    SLIP_ESC_ESC => SLIP_ESC,
                    _ => {
                        return Err(FrameError::MalformedPacket {
                            reason: "invalid escape sequence",
                        })
                    }
                };
                frame.push(literal);
            } else {
                match byte {
                    SLIP_START => {
                        log::debug!("Start marker inside frame, discarding {} bytes", frame.len());
                        frame.clear();
                        continue;
                    }
                    SLIP_END => {
                        if frame.is_empty() {
                            return Err(FrameError::MalformedPacket {
                                reason: "empty frame",
                            });
                        }
                        return Ok(frame);
                    }
                    SLIP_ESC => {
                        escaped = true;
                        continue;
                    }
                    _ => frame.push(byte),
                }
            }

            if frame.len() > self.max_frame_len {
                return Err(FrameError::MalformedPacket {
                    reason: "frame exceeds maximum length",
                });
            }
        }
    }

    fn await_start<S: ByteSource + ?Sized>(&self, source: &S) -> Result<(), FrameError> {
        let deadline = Instant::now() + self.byte_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match source.read_byte(Some(remaining)) {
                Some(SLIP_START) => return Ok(()),
                Some(_) if Instant::now() >= deadline => return Err(FrameError::Timeout),
                Some(_) => continue,
                None if !source.is_open() => return Err(FrameError::TransportClosed),
                None => return Err(FrameError::Timeout),
            }
        }
    }
}
