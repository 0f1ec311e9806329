/// NDJSON output: turns pipeline events into [`EventMessage`] lines and
/// writes them to any byte sink (stdout, a file, a socket).
use std::io::Write;

use anyhow::Context;

use crate::dispatch::{Event, Listener};
use crate::protocol::{EventMessage, MAX_MSG_LEN, VERSION};

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a message to JSON and append the NDJSON newline.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_message(msg: &EventMessage, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) if len < buf.len() => {
            buf[len] = b'\n';
            Some(len + 1)
        }
        Ok(_) | Err(_) => None,
    }
}

/// Serialize `event` as one NDJSON line into `buf`.
pub fn serialize_event(event: &Event, buf: &mut [u8]) -> Option<usize> {
    match event {
        Event::Encounter(e) => serialize_message(
            &EventMessage::Encounter {
                key: &e.device_key,
                data: &e.service_data,
                rssi: e.rssi,
                ts: e.timestamp.timestamp_millis(),
            },
            buf,
        ),
        Event::Linked(link) => {
            let old = link.old.to_string();
            let new = link.new.to_string();
            serialize_message(
                &EventMessage::Link {
                    old: &old,
                    new: &new,
                    gap_ms: link.gap_ms(),
                    multiple: link.evidence.interval_multiple,
                    residual_ms: link.evidence.residual_ms,
                    old_rssi: link.evidence.old_rssi.round() as i16,
                    new_rssi: link.evidence.new_rssi.round() as i16,
                    ts: link.discovered_at.timestamp_millis(),
                },
                buf,
            )
        }
        Event::SourceClosed(reason) => serialize_message(&EventMessage::Closed { reason }, buf),
    }
}

// ── Listener ───────────────────────────────────────────────────────────

/// Streams every event it receives as one JSON line.
pub struct NdjsonListener<W: Write> {
    out: W,
    buf: [u8; MAX_MSG_LEN],
}

impl<W: Write> NdjsonListener<W> {
    /// Start a stream, writing the `hello` line for `source`.
    pub fn new(mut out: W, source: &str) -> anyhow::Result<Self> {
        let mut buf = [0u8; MAX_MSG_LEN];
        let len = serialize_message(&EventMessage::Hello { version: VERSION, source }, &mut buf)
            .context("hello message does not fit the message buffer")?;
        out.write_all(&buf[..len])?;
        out.flush()?;
        Ok(Self { out, buf })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Listener for NdjsonListener<W> {
    fn name(&self) -> &str {
        "ndjson"
    }

    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        let Some(len) = serialize_event(event, &mut self.buf) else {
            log::warn!("Dropping {:?} event too large for NDJSON output", event.kind());
            return Ok(());
        };
        self.out.write_all(&self.buf[..len])?;
        self.out.flush()?;
        Ok(())
    }
}
