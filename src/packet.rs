/// Sniffer packet layer: the header carried inside every frame, the packet
/// ids we care about, and the BLE advertising report inside event packets.
///
/// Packet header (little-endian):
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       2     Payload length
/// 2       1     Protocol version
/// 3       2     Packet counter
/// 5       1     Packet id
/// 6       N     Payload
/// ```
///
/// Event packet payload:
///
/// ```text
/// 0       1     Event header length (>= 10)
/// 1       1     Flags
/// 2       1     Channel
/// 3       1     RSSI magnitude (dBm = -value)
/// 4       2     Event counter
/// 6       4     Firmware timestamp (us)
/// hdr     4     Access address
/// hdr+4   1     PDU header
/// hdr+5   1     PDU length
/// hdr+6   6     Advertiser address (least significant byte first)
/// hdr+12  ..    Advertising data, then 3-byte CRC
/// ```
use crate::error::FrameError;

pub const HEADER_LEN: usize = 6;

/// Protocol version written into requests.
pub const PROTOCOL_VERSION: u8 = 3;

const EVENT_HEADER_MIN: usize = 10;
const ADDRESS_OFFSET: usize = 4 + 1 + 1;

/// Packet ids of the sniffer UART protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketId {
    /// Advertising PDU event (protocol 3).
    EventAdvPdu,
    /// Captured packet event (protocol 2; data PDU in protocol 3).
    EventPacket,
    ScanContinuousRequest,
    PingRequest,
    PingResponse,
    SetAdvChannelHopSequence,
    GoIdle,
    Other(u8),
}

impl PacketId {
    pub fn from_u8(id: u8) -> Self {
        match id {
            0x02 => PacketId::EventAdvPdu,
            0x06 => PacketId::EventPacket,
            0x07 => PacketId::ScanContinuousRequest,
            0x0D => PacketId::PingRequest,
            0x0E => PacketId::PingResponse,
            0x17 => PacketId::SetAdvChannelHopSequence,
            0xFE => PacketId::GoIdle,
            other => PacketId::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PacketId::EventAdvPdu => 0x02,
            PacketId::EventPacket => 0x06,
            PacketId::ScanContinuousRequest => 0x07,
            PacketId::PingRequest => 0x0D,
            PacketId::PingResponse => 0x0E,
            PacketId::SetAdvChannelHopSequence => 0x17,
            PacketId::GoIdle => 0xFE,
            PacketId::Other(id) => id,
        }
    }

    /// Whether this packet carries a captured radio packet.
    pub fn is_capture_event(self) -> bool {
        matches!(self, PacketId::EventAdvPdu | PacketId::EventPacket)
    }
}

/// One decoded sniffer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnifferPacket {
    /// Source board, assigned by the reader rather than sent on the wire.
    pub board_id: u8,
    pub protocol_version: u8,
    pub counter: u16,
    pub id: PacketId,
    pub payload: Vec<u8>,
}

impl SnifferPacket {
    /// Build a host → sniffer request.
    pub fn request(id: PacketId, counter: u16, payload: &[u8]) -> Self {
        Self {
            board_id: 0,
            protocol_version: PROTOCOL_VERSION,
            counter,
            id,
            payload: payload.to_vec(),
        }
    }

    /// Parse an unescaped frame. The declared payload length must match
    /// the bytes actually present.
    pub fn parse(board_id: u8, frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < HEADER_LEN {
            return Err(FrameError::MalformedPacket {
                reason: "frame shorter than packet header",
            });
        }
        let payload_len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        if payload_len != frame.len() - HEADER_LEN {
            return Err(FrameError::MalformedPacket {
                reason: "payload length mismatch",
            });
        }
        Ok(Self {
            board_id,
            protocol_version: frame[2],
            counter: u16::from_le_bytes([frame[3], frame[4]]),
            id: PacketId::from_u8(frame[5]),
            payload: frame[HEADER_LEN..].to_vec(),
        })
    }

    /// Header + payload, ready for SLIP encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.push(self.protocol_version);
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.push(self.id.as_u8());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// A BLE advertisement captured by the sniffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleAdvReport {
    pub channel: u8,
    pub rssi: i16,
    pub timestamp_us: u32,
    /// Advertiser address, least significant byte first.
    pub address: [u8; 6],
    /// Advertising data followed by the CRC.
    pub data: Vec<u8>,
}

impl BleAdvReport {
    /// Extract the advertising report from a capture event packet.
    /// Returns `None` for any other packet or a truncated event.
    pub fn parse(packet: &SnifferPacket) -> Option<Self> {
        if !packet.id.is_capture_event() {
            return None;
        }
        let p = &packet.payload;
        let header_len = *p.first()? as usize;
        if header_len < EVENT_HEADER_MIN {
            return None;
        }
        let ble = p.get(header_len..)?;
        let address: [u8; 6] = ble.get(ADDRESS_OFFSET..ADDRESS_OFFSET + 6)?.try_into().ok()?;

        Some(Self {
            channel: p[2],
            rssi: -(p[3] as i16),
            timestamp_us: u32::from_le_bytes(p[6..10].try_into().ok()?),
            address,
            data: ble[ADDRESS_OFFSET + 6..].to_vec(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a capture event packet around `adv_data` (CRC appended).
    pub(crate) fn adv_event(address: [u8; 6], rssi_magnitude: u8, adv_data: &[u8]) -> SnifferPacket {
        let mut payload = vec![10, 0x01, 37, rssi_magnitude, 0x01, 0x00, 0x10, 0x20, 0x30, 0x40];
        payload.extend_from_slice(&[0xD6, 0xBE, 0x89, 0x8E]); // access address
        payload.push(0x02); // ADV_NONCONN_IND
        payload.push((6 + adv_data.len()) as u8);
        payload.extend_from_slice(&address);
        payload.extend_from_slice(adv_data);
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC]); // CRC
        SnifferPacket {
            board_id: 0,
            protocol_version: PROTOCOL_VERSION,
            counter: 1,
            id: PacketId::EventAdvPdu,
            payload,
        }
    }

    // ── Header ──────────────────────────────────────────────────────

    #[test]
    fn header_fields_are_little_endian() {
        let packet = SnifferPacket::request(PacketId::PingRequest, 0x1234, &[]);
        assert_eq!(packet.to_bytes(), vec![0x00, 0x00, 3, 0x34, 0x12, 0x0D]);
    }

    #[test]
    fn parse_reads_header_and_payload() {
        let frame = [0x02, 0x00, 3, 0x05, 0x00, 0x0E, 0xAA, 0xBB];
        let packet = SnifferPacket::parse(7, &frame).unwrap();
        assert_eq!(packet.board_id, 7);
        assert_eq!(packet.counter, 5);
        assert_eq!(packet.id, PacketId::PingResponse);
        assert_eq!(packet.payload, vec![0xAA, 0xBB]);
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let frame = [0x05, 0x00, 3, 0x00, 0x00, 0x0E, 0xAA];
        assert_eq!(
            SnifferPacket::parse(0, &frame),
            Err(FrameError::MalformedPacket {
                reason: "payload length mismatch"
            })
        );
    }

    #[test]
    fn parse_rejects_short_frame() {
        assert!(SnifferPacket::parse(0, &[0x00, 0x00, 3]).is_err());
    }

    #[test]
    fn unknown_ids_survive_round_trip() {
        assert_eq!(PacketId::from_u8(0x42), PacketId::Other(0x42));
        assert_eq!(PacketId::Other(0x42).as_u8(), 0x42);
        assert_eq!(PacketId::from_u8(0x17), PacketId::SetAdvChannelHopSequence);
    }

    // ── Advertising reports ─────────────────────────────────────────

    #[test]
    fn adv_report_extracts_address_rssi_and_data() {
        let packet = adv_event([1, 2, 3, 4, 5, 6], 61, &[0x02, 0x01, 0x1A]);
        let report = BleAdvReport::parse(&packet).unwrap();
        assert_eq!(report.address, [1, 2, 3, 4, 5, 6]);
        assert_eq!(report.rssi, -61);
        assert_eq!(report.channel, 37);
        assert_eq!(report.timestamp_us, 0x4030_2010);
        assert_eq!(report.data, vec![0x02, 0x01, 0x1A, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn non_event_packets_have_no_report() {
        let packet = SnifferPacket::request(PacketId::PingResponse, 0, &[0; 32]);
        assert!(BleAdvReport::parse(&packet).is_none());
    }

    #[test]
    fn truncated_event_has_no_report() {
        let mut packet = adv_event([0; 6], 50, &[]);
        packet.payload.truncate(16);
        assert!(BleAdvReport::parse(&packet).is_none());
    }
}
