/// Default protocol constants for Exposure Notification beacon capture.
///
/// Byte signatures come from the Exposure Notification Bluetooth
/// specification: a Complete List of 16-bit Service UUIDs AD structure
/// carrying `0xFD6F`, followed by a Service Data AD structure for the same
/// UUID holding the 16-byte Rolling Proximity Identifier and 4 bytes of
/// Associated Encrypted Metadata.

/// Exposure Notification 16-bit service UUID.
pub const EXPOSURE_NOTIFICATION_UUID_16: u16 = 0xFD6F;

/// Exposure Notification 128-bit service UUID string.
pub const EXPOSURE_NOTIFICATION_UUID: &str = "0000fd6f-0000-1000-8000-00805f9b34fb";

/// AD structure `[len=3, type=0x03, 0x6F, 0xFD]`; presence of the
/// service UUID list marks an advertisement as belonging to the protocol.
pub static ADV_SIGNATURE: &[u8] = &[0x03, 0x03, 0x6F, 0xFD];

/// AD structure header `[len=0x17, type=0x16, 0x6F, 0xFD]`; the payload
/// fragment starts immediately after these bytes.
pub static SERVICE_DATA_MARKER: &[u8] = &[0x17, 0x16, 0x6F, 0xFD];

/// Bytes to strip from the end of the captured packet (the BLE CRC).
pub const TRAILING_LEN: usize = 3;

/// BLE advertising channels hopped by the sniffer.
pub static ADV_HOP_SEQUENCE: &[u8] = &[37, 38, 39];

// ── Device tracking ───────────────────────────────────────────────────

/// Reads closer than this to the previous read are duplicate captures of
/// one broadcast on another advertising channel.
pub const MIN_READ_GAP_MS: u64 = 10;

/// Number of reads averaged for leading/trailing RSSI.
pub const ROLLING_WINDOW: usize = 10;

/// Devices silent for longer than this are evicted from the tracker.
pub const RETENTION_SECS: u64 = 600;

// ── Identity linking ──────────────────────────────────────────────────

/// A device silent for this long is presumed to have rotated its address.
pub const INACTIVE_AFTER_MS: u64 = 20_000;

/// A new identifier must appear within this long after the old one stopped.
pub const MAX_GAP_MS: u64 = 20_000;

/// Nominal advertising interval of the protocol (200–270 ms on air).
pub const BROADCAST_INTERVAL_MS: u64 = 250;

/// Maximum distance of a gap from the nearest interval multiple.
pub const CADENCE_TOLERANCE_MS: u64 = 100;

/// Maximum difference between trailing and leading average RSSI (dB).
pub const RSSI_THRESHOLD: u16 = 20;

// ── Framing ───────────────────────────────────────────────────────────

/// Time allowed for a start-of-frame marker to arrive.
pub const BYTE_TIMEOUT_MS: u64 = 300;

/// Time allowed for a started frame to complete.
pub const COMPLETE_TIMEOUT_MS: u64 = 300;

/// Frames longer than this are discarded as garbage.
pub const MAX_FRAME_LEN: usize = 1024;

/// Idle poll interval of the pipeline; doubles as the linker tick.
pub const POLL_INTERVAL_MS: u64 = 200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_carry_the_service_uuid_little_endian() {
        let [lo, hi] = EXPOSURE_NOTIFICATION_UUID_16.to_le_bytes();
        assert_eq!(&ADV_SIGNATURE[2..], &[lo, hi]);
        assert_eq!(&SERVICE_DATA_MARKER[2..], &[lo, hi]);
        assert!(EXPOSURE_NOTIFICATION_UUID.starts_with("0000fd6f"));
    }

    #[test]
    fn service_data_length_covers_uuid_and_payload() {
        // AD length counts type (1) + UUID (2) + RPI (16) + AEM (4)
        assert_eq!(SERVICE_DATA_MARKER[0] as usize, 1 + 2 + 16 + 4);
    }

    #[test]
    fn retention_outlives_link_windows() {
        assert!(RETENTION_SECS * 1000 >= INACTIVE_AFTER_MS + MAX_GAP_MS);
    }
}
