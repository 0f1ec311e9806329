/// Capture file writer in libpcap format, link type `NORDIC_BLE` (157).
///
/// Every record is the board id followed by the raw sniffer packet
/// (header + payload), exactly as it came off the wire.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::packet::SnifferPacket;

pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
pub const PCAP_VERSION: (u16, u16) = (2, 4);
pub const SNAPLEN: u32 = 0xFFFF;
pub const LINKTYPE_NORDIC_BLE: u32 = 157;

/// An existing capture file larger than this is rolled over at open.
pub const ROLLOVER_BYTES: u64 = 20_000_000;

/// 24-byte pcap global header.
pub fn global_header() -> [u8; 24] {
    let mut header = [0u8; 24];
    header[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&PCAP_VERSION.0.to_le_bytes());
    header[6..8].copy_from_slice(&PCAP_VERSION.1.to_le_bytes());
    // thiszone and sigfigs stay zero
    header[16..20].copy_from_slice(&SNAPLEN.to_le_bytes());
    header[20..24].copy_from_slice(&LINKTYPE_NORDIC_BLE.to_le_bytes());
    header
}

/// 16-byte record header: seconds, microseconds, included and original length.
pub fn record_header(timestamp: DateTime<Utc>, len: u32) -> [u8; 16] {
    let mut header = [0u8; 16];
    header[0..4].copy_from_slice(&(timestamp.timestamp() as u32).to_le_bytes());
    header[4..8].copy_from_slice(&timestamp.timestamp_subsec_micros().to_le_bytes());
    header[8..12].copy_from_slice(&len.to_le_bytes());
    header[12..16].copy_from_slice(&len.to_le_bytes());
    header
}

/// Anything that accepts decoded sniffer packets for archiving.
pub trait PacketSink: Send {
    fn write_packet(&mut self, packet: &SnifferPacket, timestamp: DateTime<Utc>) -> io::Result<()>;
}

pub struct CaptureWriter<W: Write> {
    out: W,
    records: u64,
}

impl<W: Write> CaptureWriter<W> {
    /// Wrap a fresh output, writing the global header first.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(&global_header())?;
        out.flush()?;
        Ok(Self { out, records: 0 })
    }

    /// Wrap an output that already carries a global header.
    pub fn append(out: W) -> Self {
        Self { out, records: 0 }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> PacketSink for CaptureWriter<W> {
    fn write_packet(&mut self, packet: &SnifferPacket, timestamp: DateTime<Utc>) -> io::Result<()> {
        let mut record = Vec::with_capacity(1 + packet.payload.len() + crate::packet::HEADER_LEN);
        record.push(packet.board_id);
        record.extend_from_slice(&packet.to_bytes());

        self.out.write_all(&record_header(timestamp, record.len() as u32))?;
        self.out.write_all(&record)?;
        self.out.flush()?;
        self.records += 1;
        Ok(())
    }
}

/// Open `path` for appending capture records.
///
/// A missing file is created with a global header. A file larger than
/// [`ROLLOVER_BYTES`] is moved to `<path>.1` (replacing any previous
/// backup) and a fresh file is started.
pub fn open_capture(path: &Path) -> io::Result<CaptureWriter<BufWriter<File>>> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    match fs::metadata(path) {
        Ok(meta) if meta.len() > ROLLOVER_BYTES => {
            let backup = backup_path(path);
            log::info!("Rolling capture file {} over to {}", path.display(), backup.display());
            if let Err(e) = fs::remove_file(&backup) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("Could not remove old capture backup {}: {}", backup.display(), e);
                }
            }
            fs::rename(path, &backup)?;
            CaptureWriter::new(BufWriter::new(File::create(path)?))
        }
        Ok(meta) if meta.len() > 0 => {
            let file = OpenOptions::new().append(true).open(path)?;
            Ok(CaptureWriter::append(BufWriter::new(file)))
        }
        _ => CaptureWriter::new(BufWriter::new(File::create(path)?)),
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}
