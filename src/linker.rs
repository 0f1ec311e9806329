/// Identity linker: decides whether a device that has gone quiet continued
/// under a new rotating identifier.
///
/// A pass walks devices in order of first sighting. A device silent for
/// longer than `inactive_after` is an *old* candidate. Its *new* candidate
/// is the first other device whose first read lands no earlier than the old
/// device's last read and within `max_gap` of it, whose gap sits close to a
/// multiple of the broadcast interval, and whose leading RSSI matches the
/// old device's trailing RSSI. Links are never retracted or re-scored.
use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::defaults;
use crate::encounter::DeviceId;
use crate::tracker::{Device, DeviceTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    pub inactive_after_ms: u64,
    pub max_gap_ms: u64,
    pub broadcast_interval_ms: u64,
    pub cadence_tolerance_ms: u64,
    /// Largest accepted |trailing - leading| average RSSI, in dB.
    pub rssi_threshold: u16,
    /// Reads averaged on each side of the gap.
    pub rssi_window: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            inactive_after_ms: defaults::INACTIVE_AFTER_MS,
            max_gap_ms: defaults::MAX_GAP_MS,
            broadcast_interval_ms: defaults::BROADCAST_INTERVAL_MS,
            cadence_tolerance_ms: defaults::CADENCE_TOLERANCE_MS,
            rssi_threshold: defaults::RSSI_THRESHOLD,
            rssi_window: defaults::ROLLING_WINDOW,
        }
    }
}

/// Measurements that made a pair qualify.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvidence {
    pub gap: Duration,
    /// Nearest whole number of broadcast intervals in the gap.
    pub interval_multiple: i64,
    /// Distance of the gap from that multiple, in milliseconds.
    pub residual_ms: i64,
    pub old_rssi: f64,
    pub new_rssi: f64,
}

impl LinkEvidence {
    pub fn rssi_delta(&self) -> f64 {
        (self.old_rssi - self.new_rssi).abs()
    }
}

/// One discovered continuation `old -> new`.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub old: DeviceId,
    pub new: DeviceId,
    /// Clock reading of the pass that found the link.
    pub discovered_at: DateTime<Utc>,
    pub evidence: LinkEvidence,
}

impl Link {
    pub fn gap_ms(&self) -> i64 {
        self.evidence.gap.num_milliseconds()
    }
}

/// Why a candidate pair did not qualify. Not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// One of the devices has no reads.
    NoReads,
    /// The new device was already seen before the old one went quiet.
    StartedBefore,
    GapTooLong { gap_ms: i64 },
    OffCadence { residual_ms: i64 },
    RssiJump { delta: f64 },
}

pub struct IdentityLinker {
    config: LinkerConfig,
    links: Vec<Link>,
    /// Old devices that already have a link.
    resolved: HashSet<DeviceId>,
    /// New devices already claimed by a link.
    claimed: HashSet<DeviceId>,
    linked_pairs: HashSet<(DeviceId, DeviceId)>,
}

impl IdentityLinker {
    pub fn new(config: LinkerConfig) -> Self {
        Self {
            config,
            links: Vec::new(),
            resolved: HashSet::new(),
            claimed: HashSet::new(),
            linked_pairs: HashSet::new(),
        }
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// Every link found so far, in discovery order.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Run one pass at clock reading `now` and return the links it added.
    pub fn scan(&mut self, tracker: &DeviceTracker, now: DateTime<Utc>) -> Vec<Link> {
        let inactive_after = ms(self.config.inactive_after_ms);
        let mut found = Vec::new();

        for old in tracker.devices() {
            if self.resolved.contains(&old.id) {
                continue;
            }
            let Some(last_time) = old.last_time() else {
                continue;
            };
            if now - last_time <= inactive_after {
                continue;
            }

            for new in tracker.devices() {
                if new.id == old.id
                    || self.claimed.contains(&new.id)
                    || self.linked_pairs.contains(&(old.id.clone(), new.id.clone()))
                {
                    continue;
                }
                match self.evaluate(old, new) {
                    Ok(evidence) => {
                        let link = Link {
                            old: old.id.clone(),
                            new: new.id.clone(),
                            discovered_at: now,
                            evidence,
                        };
                        log::info!("{} is now {} after gap of {}ms", link.old, link.new, link.gap_ms());
                        self.resolved.insert(link.old.clone());
                        self.claimed.insert(link.new.clone());
                        self.linked_pairs.insert((link.old.clone(), link.new.clone()));
                        self.links.push(link.clone());
                        found.push(link);
                        break;
                    }
                    Err(SkipReason::StartedBefore) => {}
                    Err(reason) => {
                        log::debug!("Not linking {} -> {}: {:?}", old.id, new.id, reason);
                    }
                }
            }
        }
        found
    }

    /// Score a single `old -> new` pair against every threshold.
    pub fn evaluate(&self, old: &Device, new: &Device) -> Result<LinkEvidence, SkipReason> {
        let (Some(last_time), Some(first_time)) = (old.last_time(), new.first_time()) else {
            return Err(SkipReason::NoReads);
        };
        if first_time < last_time {
            return Err(SkipReason::StartedBefore);
        }

        let gap = first_time - last_time;
        if gap > ms(self.config.max_gap_ms) {
            return Err(SkipReason::GapTooLong {
                gap_ms: gap.num_milliseconds(),
            });
        }

        let (interval_multiple, residual_ms) = cadence(gap, self.config.broadcast_interval_ms);
        if residual_ms > self.config.cadence_tolerance_ms as i64 {
            return Err(SkipReason::OffCadence { residual_ms });
        }

        let window = self.config.rssi_window;
        let (Some(old_rssi), Some(new_rssi)) =
            (old.last_average_rssi(window), new.first_average_rssi(window))
        else {
            return Err(SkipReason::NoReads);
        };
        let delta = (old_rssi - new_rssi).abs();
        if delta > f64::from(self.config.rssi_threshold) {
            return Err(SkipReason::RssiJump { delta });
        }

        Ok(LinkEvidence {
            gap,
            interval_multiple,
            residual_ms,
            old_rssi,
            new_rssi,
        })
    }

    /// Drop markers for a device that left the tracker. The link log is kept.
    pub fn forget(&mut self, id: &DeviceId) {
        self.resolved.remove(id);
        self.claimed.remove(id);
        self.linked_pairs.retain(|(old, new)| old != id && new != id);
    }
}

fn ms(value: u64) -> Duration {
    Duration::milliseconds(value as i64)
}

/// Nearest interval multiple of `gap` and the residual distance from it.
fn cadence(gap: Duration, interval_ms: u64) -> (i64, i64) {
    let gap_ms = gap.num_milliseconds();
    let interval = interval_ms.max(1) as i64;
    let multiple = (gap_ms + interval / 2) / interval;
    (multiple, (gap_ms - multiple * interval).abs())
}
