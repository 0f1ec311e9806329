/// Sniffer session control: request encoding, scan setup, baud probing
/// and port discovery.
use std::time::Duration;

use crate::error::TransportError;
use crate::packet::{PacketId, SnifferPacket};
use crate::slip::{encode_frame, FrameDecoder};
use crate::transport::Transport;

/// Time allowed for a ping response while probing.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Advertising channels the sniffer may hop.
const ADV_CHANNELS: [u8; 3] = [37, 38, 39];

/// Destination of encoded request frames.
pub trait FrameSink {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
}

impl FrameSink for Transport {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.write(frame)
    }
}

impl<T: FrameSink + ?Sized> FrameSink for &T {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).send(frame)
    }
}

impl<T: FrameSink + ?Sized> FrameSink for std::sync::Arc<T> {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).send(frame)
    }
}

/// Issues requests to a sniffer with a rolling packet counter.
pub struct SnifferControl<S: FrameSink> {
    sink: S,
    counter: u16,
}

impl<S: FrameSink> SnifferControl<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, counter: 0 }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Encode and send one request.
    pub fn send_request(&mut self, id: PacketId, payload: &[u8]) -> Result<(), TransportError> {
        let packet = SnifferPacket::request(id, self.counter, payload);
        self.counter = self.counter.wrapping_add(1);
        log::debug!("Sending {:?} (counter {})", id, packet.counter);
        self.sink.send(&encode_frame(&packet.to_bytes()))
    }

    pub fn ping(&mut self) -> Result<(), TransportError> {
        self.send_request(PacketId::PingRequest, &[])
    }

    /// Start continuous scanning of advertising channels.
    pub fn start_scan(&mut self, find_scan_rsp: bool, find_aux: bool, scan_coded: bool) -> Result<(), TransportError> {
        let flags = u8::from(find_scan_rsp) | u8::from(find_aux) << 1 | u8::from(scan_coded) << 2;
        self.send_request(PacketId::ScanContinuousRequest, &[flags])
    }

    /// Set which advertising channels to hop, in order. Channels outside
    /// 37..=39 are dropped; an empty sequence falls back to all three.
    pub fn set_adv_hop_sequence(&mut self, channels: &[u8]) -> Result<(), TransportError> {
        let mut sequence: Vec<u8> = channels
            .iter()
            .copied()
            .filter(|c| ADV_CHANNELS.contains(c))
            .take(ADV_CHANNELS.len())
            .collect();
        if sequence.len() != channels.len() {
            log::warn!("Ignoring invalid hop channels in {:?}", channels);
        }
        if sequence.is_empty() {
            sequence = ADV_CHANNELS.to_vec();
        }

        let mut payload = vec![sequence.len() as u8];
        payload.extend_from_slice(&sequence);
        payload.resize(1 + ADV_CHANNELS.len(), ADV_CHANNELS[0]);
        self.send_request(PacketId::SetAdvChannelHopSequence, &payload)
    }

    pub fn go_idle(&mut self) -> Result<(), TransportError> {
        self.send_request(PacketId::GoIdle, &[])
    }
}

/// Ping through `control` and wait for any frame on `transport`.
pub fn answers_ping<S: FrameSink>(control: &mut SnifferControl<S>, transport: &Transport) -> bool {
    let decoder = FrameDecoder::new(PROBE_TIMEOUT, PROBE_TIMEOUT, crate::defaults::MAX_FRAME_LEN);
    if control.ping().is_err() {
        return false;
    }
    decoder.decode(transport).is_ok()
}

/// First allowed baud rate at which `port` answers a ping.
#[cfg(feature = "serial")]
pub fn probe_baud_rate(port: &str) -> Option<u32> {
    use std::sync::Arc;

    for &rate in crate::transport::SNIFFER_BAUD_RATES {
        let transport = match Transport::open(port, rate) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                log::debug!("Probe of {} at {} failed: {}", port, rate, e);
                continue;
            }
        };
        let mut control = SnifferControl::new(Arc::clone(&transport));
        let found = answers_ping(&mut control, &transport);
        transport.close();
        if found {
            log::info!("Sniffer on {} answers at {} baud", port, rate);
            return Some(rate);
        }
    }
    None
}

/// Every serial port with a sniffer attached, with its baud rate.
#[cfg(feature = "serial")]
pub fn find_sniffers() -> Vec<(String, u32)> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("Could not list serial ports: {}", e);
            return Vec::new();
        }
    };
    ports
        .into_iter()
        .filter_map(|info| probe_baud_rate(&info.port_name).map(|rate| (info.port_name, rate)))
        .collect()
}
