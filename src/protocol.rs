/// JSON event protocol for downstream tools.
///
/// All messages are newline-delimited JSON (NDJSON), one object per line,
/// discriminated by a `type` field. Times are milliseconds since the Unix
/// epoch; signal values are whole dBm.
use serde::Serialize;

/// Messages streamed to consumers of the event feed.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum EventMessage<'a> {
    /// First line of every stream.
    #[serde(rename = "hello")]
    Hello {
        version: &'static str,
        /// Which backend feeds the pipeline.
        source: &'a str,
    },
    /// One observed advertisement
    #[serde(rename = "encounter")]
    Encounter {
        key: &'a str,
        data: &'a str,
        rssi: i16,
        ts: i64,
    },
    /// A rotating identifier was linked to its successor
    #[serde(rename = "link")]
    Link {
        old: &'a str,
        new: &'a str,
        gap_ms: i64,
        /// Broadcast intervals spanned by the gap
        multiple: i64,
        residual_ms: i64,
        /// Trailing average RSSI of the old identifier, rounded
        old_rssi: i16,
        /// Leading average RSSI of the new identifier, rounded
        new_rssi: i16,
        ts: i64,
    },
    /// The source stopped; no further messages follow.
    #[serde(rename = "closed")]
    Closed { reason: &'a str },
}

/// Crate version reported in the `hello` message.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;
