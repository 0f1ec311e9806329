/// Error taxonomy for the capture pipeline.
///
/// Transport errors are fatal to the transport instance that raised them.
/// Framing errors are recoverable and never leave the sniffer source.
/// Unrecognized advertisements and rejected link candidates are not errors
/// at all and have no variant here.
use std::io;

use thiserror::Error;

/// Failures of the serial link to the sniffer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The requested baud rate is not one the sniffer firmware speaks.
    #[error("Invalid baud rate: {rate} (expected one of {allowed:?})")]
    InvalidBaudRate {
        rate: u32,
        allowed: &'static [u32],
    },

    /// The port could not be opened.
    #[error("Failed to open serial port {port}: {message}")]
    Open {
        port: String,
        message: String,
    },

    /// Hard I/O failure on an open port. The transport is closed afterwards.
    #[error("Serial I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: io::Error,
    },

    /// The transport was already closed (explicitly or after a device error).
    #[error("Transport {port} is closed")]
    Closed {
        port: String,
    },
}

/// Framing errors raised while reassembling sniffer packets.
///
/// All variants except `TransportClosed` are recoverable: the decoder
/// resynchronizes on the next start-of-frame marker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// No start-of-frame marker arrived within the byte timeout.
    #[error("Timed out waiting for a frame")]
    Timeout,

    /// A frame started but was not closed within the completion timeout.
    #[error("Incomplete packet: {received} bytes received before timeout")]
    IncompletePacket {
        received: usize,
    },

    /// Escape, length or size violation inside a frame.
    #[error("Malformed packet: {reason}")]
    MalformedPacket {
        reason: &'static str,
    },

    /// The underlying transport is gone; no further frames will arrive.
    #[error("Transport closed while decoding")]
    TransportClosed,
}

/// A replay-log line that could not be turned into an encounter.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Line {line}: expected 4 comma-separated fields, got {got}")]
    FieldCount {
        line: usize,
        got: usize,
    },

    #[error("Line {line}: invalid timestamp '{value}'")]
    Timestamp {
        line: usize,
        value: String,
    },

    #[error("Line {line}: invalid RSSI '{value}'")]
    Rssi {
        line: usize,
        value: String,
    },

    #[error("Replay log read failed: {0}")]
    Io(#[from] io::Error),
}

/// Terminal failures of an encounter source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The transport under a live source went away. Callers should
    /// re-probe the sniffer rather than retry reads.
    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
