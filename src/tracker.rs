/// Per-device aggregation of encounters.
///
/// Each device owns an append-only, time-ordered list of reads. Derived
/// statistics are computed on demand and return `None` for an empty device
/// rather than a numeric default.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::defaults;
use crate::encounter::{DeviceId, Encounter};

/// Tracker shared between the pipeline and listeners that render it.
pub type SharedTracker = Arc<Mutex<DeviceTracker>>;

/// One `(timestamp, rssi)` sample of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Read {
    pub timestamp: DateTime<Utc>,
    pub rssi: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Reads closer than this to the previous read are dropped.
    pub min_read_gap_ms: u64,
    /// Number of reads averaged by the device table.
    pub rolling_window: usize,
    /// Devices silent for longer than this are evicted. `None` keeps them
    /// for the life of the process.
    pub retention_secs: Option<u64>,
    /// Key devices by `(key, service_data)` instead of the key alone.
    pub key_by_service_data: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_read_gap_ms: defaults::MIN_READ_GAP_MS,
            rolling_window: defaults::ROLLING_WINDOW,
            retention_secs: Some(defaults::RETENTION_SECS),
            key_by_service_data: false,
        }
    }
}

// ── Device ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    /// Payload fragment of the first sighting.
    pub service_data: String,
    reads: Vec<Read>,
}

impl Device {
    pub fn new(id: DeviceId, service_data: impl Into<String>) -> Self {
        Self {
            id,
            service_data: service_data.into(),
            reads: Vec::new(),
        }
    }

    /// Append a read unless it is out of order or within `min_gap` of the
    /// previous read. Returns whether the read was kept.
    pub fn push(&mut self, read: Read, min_gap: Duration) -> bool {
        if let Some(last) = self.reads.last() {
            if read.timestamp < last.timestamp || read.timestamp - last.timestamp < min_gap {
                return false;
            }
        }
        self.reads.push(read);
        true
    }

    pub fn reads(&self) -> &[Read] {
        &self.reads
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    pub fn first_read(&self) -> Option<&Read> {
        self.reads.first()
    }

    pub fn last_read(&self) -> Option<&Read> {
        self.reads.last()
    }

    pub fn first_time(&self) -> Option<DateTime<Utc>> {
        self.first_read().map(|r| r.timestamp)
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.last_read().map(|r| r.timestamp)
    }

    /// Mean RSSI of the `min(n, len)` most recent reads.
    pub fn last_average_rssi(&self, n: usize) -> Option<f64> {
        let start = self.reads.len().saturating_sub(n);
        mean_rssi(&self.reads[start..])
    }

    /// Mean RSSI of the `min(n, len)` oldest reads.
    pub fn first_average_rssi(&self, n: usize) -> Option<f64> {
        let end = n.min(self.reads.len());
        mean_rssi(&self.reads[..end])
    }

    /// Median spacing between consecutive reads. Needs two reads.
    pub fn median_interval(&self) -> Option<Duration> {
        let mut gaps: Vec<Duration> = self
            .reads
            .windows(2)
            .map(|pair| pair[1].timestamp - pair[0].timestamp)
            .collect();
        if gaps.is_empty() {
            return None;
        }
        gaps.sort();
        let mid = gaps.len() / 2;
        if gaps.len() % 2 == 1 {
            Some(gaps[mid])
        } else {
            Some((gaps[mid - 1] + gaps[mid]) / 2)
        }
    }

    /// Time between the first and the last read.
    pub fn presence(&self) -> Option<Duration> {
        Some(self.last_time()? - self.first_time()?)
    }
}

fn mean_rssi(reads: &[Read]) -> Option<f64> {
    if reads.is_empty() {
        return None;
    }
    let sum: i64 = reads.iter().map(|r| r.rssi as i64).sum();
    Some(sum as f64 / reads.len() as f64)
}

// ── Tracker ───────────────────────────────────────────────────────────

/// All currently tracked devices, in order of first sighting.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    config: TrackerConfig,
    devices: Vec<Device>,
    index: HashMap<DeviceId, usize>,
}

impl DeviceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn shared(config: TrackerConfig) -> SharedTracker {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Fold an encounter into its device, creating the device on first
    /// sight. Returns whether a read was appended.
    pub fn record(&mut self, encounter: &Encounter) -> bool {
        let id = DeviceId::from_encounter(encounter, self.config.key_by_service_data);
        let slot = match self.index.get(&id) {
            Some(&slot) => slot,
            None => {
                log::debug!("New device {}", id);
                self.devices
                    .push(Device::new(id.clone(), encounter.service_data.clone()));
                self.index.insert(id, self.devices.len() - 1);
                self.devices.len() - 1
            }
        };

        let min_gap = Duration::milliseconds(self.config.min_read_gap_ms as i64);
        let read = Read {
            timestamp: encounter.timestamp,
            rssi: encounter.rssi,
        };
        self.devices[slot].push(read, min_gap)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Owned copies of every device, for consumers outside the lock.
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.clone()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.index.get(id).map(|&slot| &self.devices[slot])
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Timestamp of the newest read accepted so far.
    /// Drop devices silent for longer than the retention horizon and
    /// return their ids. No-op without a horizon.
    pub fn evict_inactive(&mut self, now: DateTime<Utc>) -> Vec<DeviceId> {
        let Some(secs) = self.config.retention_secs else {
            return Vec::new();
        };
        let horizon = Duration::seconds(secs as i64);

        let mut evicted = Vec::new();
        self.devices.retain(|device| {
            let stale = device.last_time().map_or(true, |t| now - t > horizon);
            if stale {
                evicted.push(device.id.clone());
            }
            !stale
        });

        if !evicted.is_empty() {
            log::debug!("Evicted {} inactive devices", evicted.len());
            self.index = self
                .devices
                .iter()
                .enumerate()
                .map(|(slot, device)| (device.id.clone(), slot))
                .collect();
        }
        evicted
    }
}
