/// The canonical observation record shared by every backend.
use core::fmt;

use chrono::{DateTime, Utc};

/// One observed advertisement.
///
/// Produced once per broadcast by an encounter source and never mutated;
/// the dispatcher hands listeners shared references only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encounter {
    /// Rotating identifier as currently broadcast.
    pub device_key: String,
    /// Opaque payload fragment, lowercase hex.
    pub service_data: String,
    pub timestamp: DateTime<Utc>,
    pub rssi: i16,
}

impl Encounter {
    pub fn new(
        device_key: impl Into<String>,
        service_data: impl Into<String>,
        timestamp: DateTime<Utc>,
        rssi: i16,
    ) -> Self {
        Self {
            device_key: device_key.into(),
            service_data: service_data.into(),
            timestamp,
            rssi,
        }
    }
}

/// Key of a tracked device: the broadcast identifier, optionally
/// qualified by the payload fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub key: String,
    pub service_data: Option<String>,
}

impl DeviceId {
    pub fn from_encounter(encounter: &Encounter, with_service_data: bool) -> Self {
        Self {
            key: encounter.device_key.clone(),
            service_data: with_service_data.then(|| encounter.service_data.clone()),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service_data {
            Some(data) => write!(f, "{} ({})", self.key, data),
            None => f.write_str(&self.key),
        }
    }
}

/// Format an over-the-air (least significant byte first) BLE address as
/// `AA:BB:CC:DD:EE:FF`.
pub fn format_mac(addr: &[u8; 6]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(17);
    for (i, byte) in addr.iter().rev().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}
