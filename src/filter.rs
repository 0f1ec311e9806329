/// Advertisement filter for sniffer captures.
///
/// Keeps only advertisements carrying the protocol signature and slices
/// the payload fragment out of them. Everything else is background noise
/// and is dropped without an error.
use serde::Deserialize;

use crate::defaults;
use crate::encounter::format_mac;
use crate::packet::BleAdvReport;

/// Runtime filter configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum RSSI threshold (dBm). Signals weaker than this are ignored.
    pub min_rssi: i16,
}

impl FilterConfig {
    pub const fn new() -> Self {
        Self { min_rssi: -127 }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the signature and payload fragment sit in an advertisement.
///
/// Offsets depend on the protocol version, so they are configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvLayout {
    /// Byte string whose presence marks a protocol advertisement.
    pub signature: Vec<u8>,
    /// The fragment starts immediately after this byte string.
    pub service_marker: Vec<u8>,
    /// Bytes to drop from the end of the packet.
    pub trailing_len: usize,
}

impl Default for AdvLayout {
    fn default() -> Self {
        Self {
            signature: defaults::ADV_SIGNATURE.to_vec(),
            service_marker: defaults::SERVICE_DATA_MARKER.to_vec(),
            trailing_len: defaults::TRAILING_LEN,
        }
    }
}

/// Identifier and fragment extracted from a matching advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvMatch {
    pub device_key: String,
    pub service_data: String,
}

/// Evaluate a captured advertisement. `None` means "not ours" and is the
/// normal outcome for most traffic.
pub fn filter_adv(report: &BleAdvReport, layout: &AdvLayout, config: &FilterConfig) -> Option<AdvMatch> {
    if report.rssi < config.min_rssi {
        return None;
    }

    let data = report.data.as_slice();
    find(data, &layout.signature)?;

    let start = find(data, &layout.service_marker)? + layout.service_marker.len();
    let end = data.len().checked_sub(layout.trailing_len)?;
    if start > end {
        return None;
    }

    Some(AdvMatch {
        device_key: format_mac(&report.address),
        service_data: hex::encode(&data[start..end]),
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
