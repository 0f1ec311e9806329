/// Encounter sources: every backend yields the same `Encounter` records,
/// so nothing downstream depends on where an observation came from.
///
/// * [`SnifferSource`] decodes frames from a serial sniffer.
/// * [`ReplaySource`] re-reads a replay log.
/// * [`ChannelSource`] adapts any producer that pushes encounters into a
///   channel, such as a platform Bluetooth stack.
use std::io::Read;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::capture::PacketSink;
use crate::encounter::Encounter;
use crate::error::{FrameError, SourceError};
use crate::filter::{filter_adv, AdvLayout, FilterConfig};
use crate::packet::{BleAdvReport, SnifferPacket};
use crate::replay::EncounterLogReader;
use crate::slip::FrameDecoder;
use crate::transport::ByteSource;

/// Outcome of one poll of a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Encounter(Encounter),
    /// Nothing arrived within the timeout; the source is still live.
    Idle,
    /// The source will never produce another encounter.
    Finished,
}

pub trait EncounterSource {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Wait up to roughly `timeout` for the next encounter.
    fn next_encounter(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError>;
}

// ── Sniffer ───────────────────────────────────────────────────────────

/// Board id stamped on packets; one source reads one sniffer.
const BOARD_ID: u8 = 0;

pub struct SnifferSource<B: ByteSource> {
    bytes: B,
    name: String,
    decoder: FrameDecoder,
    layout: AdvLayout,
    filter: FilterConfig,
    capture: Option<Box<dyn PacketSink>>,
}

impl<B: ByteSource> SnifferSource<B> {
    pub fn new(bytes: B, name: impl Into<String>, decoder: FrameDecoder, layout: AdvLayout, filter: FilterConfig) -> Self {
        Self {
            bytes,
            name: name.into(),
            decoder,
            layout,
            filter,
            capture: None,
        }
    }

    /// Archive every decoded packet into `sink`.
    pub fn with_capture(mut self, sink: Box<dyn PacketSink>) -> Self {
        self.capture = Some(sink);
        self
    }

    fn handle_packet(&mut self, packet: &SnifferPacket, now: DateTime<Utc>) -> Option<Encounter> {
        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.write_packet(packet, now) {
                log::warn!("Capture write failed, disabling capture: {}", e);
                self.capture = None;
            }
        }

        let report = BleAdvReport::parse(packet)?;
        let matched = filter_adv(&report, &self.layout, &self.filter)?;
        Some(Encounter::new(matched.device_key, matched.service_data, now, report.rssi))
    }
}

impl<B: ByteSource> EncounterSource for SnifferSource<B> {
    fn describe(&self) -> String {
        format!("sniffer on {}", self.name)
    }

    fn next_encounter(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.decoder.decode(&self.bytes) {
                Ok(frame) => match SnifferPacket::parse(BOARD_ID, &frame) {
                    Ok(packet) => {
                        if let Some(encounter) = self.handle_packet(&packet, Utc::now()) {
                            return Ok(SourcePoll::Encounter(encounter));
                        }
                    }
                    Err(e) => log::debug!("Dropping frame from {}: {}", self.name, e),
                },
                Err(FrameError::TransportClosed) => {
                    return Err(SourceError::TransportLost(self.name.clone()));
                }
                Err(FrameError::Timeout) => {}
                Err(e) => log::debug!("Framing error on {}: {}", self.name, e),
            }
            if Instant::now() >= deadline {
                return Ok(SourcePoll::Idle);
            }
        }
    }
}

// ── Replay ────────────────────────────────────────────────────────────

/// What a replay source does once its log is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndOfLog {
    /// Stay live and report `Idle` forever, like a quiet radio.
    #[default]
    Idle,
    /// Report `Finished`.
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub end_of_log: EndOfLog,
    /// Pace records by their original timestamp deltas.
    pub realtime: bool,
}

pub struct ReplaySource<R: Read> {
    log: EncounterLogReader<R>,
    name: String,
    config: ReplayConfig,
    exhausted: bool,
    /// Next record, held back while realtime pacing waits for it.
    pending: Option<Encounter>,
    /// Wall clock and log clock of the first record.
    origin: Option<(Instant, DateTime<Utc>)>,
}

impl<R: Read> ReplaySource<R> {
    pub fn new(input: R, name: impl Into<String>, config: ReplayConfig) -> Self {
        let name = name.into();
        Self {
            log: EncounterLogReader::new(input, name.clone()),
            name,
            config,
            exhausted: false,
            pending: None,
            origin: None,
        }
    }

    /// Wall-clock instant at which `encounter` is due.
    fn due_at(&mut self, encounter: &Encounter) -> Instant {
        let (wall, log) = *self.origin.get_or_insert((Instant::now(), encounter.timestamp));
        let offset = (encounter.timestamp - log).to_std().unwrap_or(Duration::ZERO);
        wall + offset
    }
}

impl<R: Read> EncounterSource for ReplaySource<R> {
    fn describe(&self) -> String {
        format!("replay of {}", self.name)
    }

    fn next_encounter(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        let next = match self.pending.take() {
            Some(encounter) => Some(encounter),
            None if self.exhausted => None,
            None => self.log.next_encounter()?,
        };

        let Some(encounter) = next else {
            if !self.exhausted {
                log::info!("End of {} after {} lines", self.name, self.log.lines());
                self.exhausted = true;
            }
            return match self.config.end_of_log {
                EndOfLog::Finish => Ok(SourcePoll::Finished),
                EndOfLog::Idle => {
                    thread::sleep(timeout);
                    Ok(SourcePoll::Idle)
                }
            };
        };

        if self.config.realtime {
            let due = self.due_at(&encounter);
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    self.pending = Some(encounter);
                    return Ok(SourcePoll::Idle);
                }
                thread::sleep(wait);
            }
        }
        Ok(SourcePoll::Encounter(encounter))
    }
}

// ── Channel ───────────────────────────────────────────────────────────

pub struct ChannelSource {
    receiver: Receiver<Encounter>,
    name: String,
}

impl ChannelSource {
    pub fn new(receiver: Receiver<Encounter>, name: impl Into<String>) -> Self {
        Self {
            receiver,
            name: name.into(),
        }
    }
}

impl EncounterSource for ChannelSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn next_encounter(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(encounter) => Ok(SourcePoll::Encounter(encounter)),
            Err(RecvTimeoutError::Timeout) => Ok(SourcePoll::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(SourcePoll::Finished),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureWriter;
    use crate::filter::tests::en_adv_data;
    use crate::packet::tests::adv_event;
    use crate::slip::encode_frame;
    use crate::slip::tests::MemorySource;
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    const TICK: Duration = Duration::from_millis(5);

    fn frame_of(packet: &SnifferPacket) -> Vec<u8> {
        encode_frame(&packet.to_bytes())
    }

    fn sniffer(bytes: MemorySource) -> SnifferSource<MemorySource> {
        let decoder = FrameDecoder::new(TICK, TICK, 256);
        SnifferSource::new(bytes, "mem", decoder, AdvLayout::default(), FilterConfig::new())
    }

    // ── Sniffer ─────────────────────────────────────────────────────

    #[test]
    fn sniffer_yields_only_protocol_adverts() {
        let bytes = MemorySource::new(&[]);
        let other = adv_event([9; 6], 40, &[0x02, 0x01, 0x06]);
        let ours = adv_event([1, 2, 3, 4, 5, 6], 58, &en_adv_data([0xAB; 16], [1, 2, 3, 4]));
        bytes.push(&frame_of(&other));
        bytes.push(&[0x00, 0xAB, 0xCD, 0x00, 0xBC]); // garbled frame
        bytes.push(&frame_of(&ours));

        let mut source = sniffer(bytes);
        let e = match source.next_encounter(Duration::from_millis(100)).unwrap() {
            SourcePoll::Encounter(e) => e,
            other => panic!("expected an encounter, got {other:?}"),
        };
        assert_eq!(e.device_key, "06:05:04:03:02:01");
        assert_eq!(e.rssi, -58);
        assert!(e.service_data.starts_with("abababab"));
        assert_eq!(source.next_encounter(TICK).unwrap(), SourcePoll::Idle);
    }

    #[test]
    fn sniffer_reports_lost_transport() {
        let bytes = MemorySource::new(&[]);
        bytes.close();
        let mut source = sniffer(bytes);
        assert!(matches!(
            source.next_encounter(TICK),
            Err(SourceError::TransportLost(name)) if name == "mem"
        ));
    }

    struct SharedSink(Arc<Mutex<CaptureWriter<Vec<u8>>>>);

    impl PacketSink for SharedSink {
        fn write_packet(&mut self, packet: &SnifferPacket, ts: DateTime<Utc>) -> std::io::Result<()> {
            self.0.lock().unwrap().write_packet(packet, ts)
        }
    }

    #[test]
    fn sniffer_tees_every_packet_to_capture() {
        let bytes = MemorySource::new(&[]);
        bytes.push(&frame_of(&adv_event([9; 6], 40, &[0x02, 0x01, 0x06])));
        bytes.push(&frame_of(&adv_event([1; 6], 40, &en_adv_data([0; 16], [0; 4]))));

        let writer = Arc::new(Mutex::new(CaptureWriter::new(Vec::new()).unwrap()));
        let mut source = sniffer(bytes).with_capture(Box::new(SharedSink(Arc::clone(&writer))));
        assert!(matches!(
            source.next_encounter(Duration::from_millis(100)).unwrap(),
            SourcePoll::Encounter(_)
        ));
        assert_eq!(writer.lock().unwrap().records(), 2);
    }

    // ── Replay ──────────────────────────────────────────────────────

    const LOG: &str = "\
2020-07-14T09:00:00Z,AA:AA,0011,-60
not a record

2020-07-14T09:00:00.250Z,AA:AA,0011,-61
";

    fn replay(config: ReplayConfig) -> ReplaySource<Cursor<&'static str>> {
        ReplaySource::new(Cursor::new(LOG), "log", config)
    }

    fn drain(source: &mut impl EncounterSource) -> Vec<Encounter> {
        let mut out = Vec::new();
        while let SourcePoll::Encounter(e) = source.next_encounter(TICK).unwrap() {
            out.push(e);
        }
        out
    }

    #[test]
    fn replay_preserves_records_and_skips_bad_lines() {
        let mut source = replay(ReplayConfig {
            end_of_log: EndOfLog::Finish,
            realtime: false,
        });
        let records = drain(&mut source);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].rssi, -61);
        assert!(records[0].timestamp < records[1].timestamp);
        assert_eq!(source.next_encounter(TICK).unwrap(), SourcePoll::Finished);
    }

    #[test]
    fn replay_reads_quoted_keys() {
        let log = "\
2020-07-14T09:00:00Z,\"Pixel, 4a\",0011,-60
2020-07-14T09:00:01Z,\"a\"\"b\",\"00,11\",-61
";
        let mut source = ReplaySource::new(
            Cursor::new(log),
            "log",
            ReplayConfig {
                end_of_log: EndOfLog::Finish,
                realtime: false,
            },
        );
        let records = drain(&mut source);
        let keys: Vec<&str> = records.iter().map(|e| e.device_key.as_str()).collect();
        assert_eq!(keys, vec!["Pixel, 4a", "a\"b"]);
        assert_eq!(records[1].service_data, "00,11");
    }

    #[test]
    fn replay_idles_after_end_of_log_by_default() {
        let mut source = replay(ReplayConfig::default());
        assert_eq!(drain(&mut source).len(), 2);
        for _ in 0..3 {
            assert_eq!(source.next_encounter(TICK).unwrap(), SourcePoll::Idle);
        }
    }

    #[test]
    fn realtime_replay_paces_records() {
        let mut source = replay(ReplayConfig {
            end_of_log: EndOfLog::Finish,
            realtime: true,
        });
        let start = Instant::now();
        let mut records = 0;
        loop {
            match source.next_encounter(Duration::from_millis(50)).unwrap() {
                SourcePoll::Encounter(_) => records += 1,
                SourcePoll::Idle => {}
                SourcePoll::Finished => break,
            }
        }
        assert_eq!(records, 2);
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    // ── Channel ─────────────────────────────────────────────────────

    #[test]
    fn channel_source_finishes_when_producer_hangs_up() {
        let (tx, rx) = mpsc::channel();
        let mut source = ChannelSource::new(rx, "native");
        assert_eq!(source.next_encounter(TICK).unwrap(), SourcePoll::Idle);

        let e = Encounter::new("AA", "00", Utc::now(), -40);
        tx.send(e.clone()).unwrap();
        drop(tx);
        assert_eq!(source.next_encounter(TICK).unwrap(), SourcePoll::Encounter(e));
        assert_eq!(source.next_encounter(TICK).unwrap(), SourcePoll::Finished);
    }
}
