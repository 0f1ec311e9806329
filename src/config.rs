/// Runtime configuration, loaded from a JSON file.
///
/// Every section and field is optional; anything missing takes its
/// default. Durations are integer milliseconds (or seconds where the name
/// says so).
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::defaults;
use crate::error::ConfigError;
use crate::filter::{AdvLayout, FilterConfig};
use crate::linker::LinkerConfig;
use crate::slip::FrameDecoder;
use crate::source::ReplayConfig;
use crate::tracker::TrackerConfig;

/// Hex byte string as written in the config file.
pub type HexString = heapless::String<64>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub linker: LinkerConfig,
    pub layout: LayoutConfig,
    pub filter: FilterConfig,
    pub framing: FramingConfig,
    pub replay: ReplayConfig,
    pub serial: SerialConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub signature: HexString,
    pub service_marker: HexString,
    pub trailing_len: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        let to_hex = |bytes: &[u8]| HexString::try_from(hex::encode(bytes).as_str()).unwrap_or_default();
        Self {
            signature: to_hex(defaults::ADV_SIGNATURE),
            service_marker: to_hex(defaults::SERVICE_DATA_MARKER),
            trailing_len: defaults::TRAILING_LEN,
        }
    }
}

impl LayoutConfig {
    pub fn to_layout(&self) -> Result<AdvLayout, ConfigError> {
        let decode = |field: &str, text: &str| {
            hex::decode(text.trim())
                .map_err(|e| ConfigError::Invalid(format!("layout.{field} is not a hex string: '{text}' ({e})")))
        };
        Ok(AdvLayout {
            signature: decode("signature", &self.signature)?,
            service_marker: decode("service_marker", &self.service_marker)?,
            trailing_len: self.trailing_len,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    pub byte_timeout_ms: u64,
    pub complete_timeout_ms: u64,
    pub max_frame_len: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            byte_timeout_ms: defaults::BYTE_TIMEOUT_MS,
            complete_timeout_ms: defaults::COMPLETE_TIMEOUT_MS,
            max_frame_len: defaults::MAX_FRAME_LEN,
        }
    }
}

impl FramingConfig {
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(
            Duration::from_millis(self.byte_timeout_ms),
            Duration::from_millis(self.complete_timeout_ms),
            self.max_frame_len,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port to open. Discovered when unset.
    pub port: Option<String>,
    /// Baud rate. Probed when unset.
    pub baud_rate: Option<u32>,
    pub hop_sequence: Vec<u8>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: None,
            hop_sequence: defaults::ADV_HOP_SEQUENCE.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Source poll timeout; also the idle link-scan tick.
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigError> {
        let (config, _) = serde_json_core::from_slice::<Config>(data).map_err(|e| ConfigError::Parse(format!("{e:?}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        log::info!("Loaded config from {}", path.display());
        Self::from_slice(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.tracker.rolling_window == 0 {
            return invalid("tracker.rolling_window must be at least 1");
        }
        if self.linker.rssi_window == 0 {
            return invalid("linker.rssi_window must be at least 1");
        }
        if self.linker.broadcast_interval_ms == 0 {
            return invalid("linker.broadcast_interval_ms must be positive");
        }
        if self.pipeline.poll_interval_ms == 0 {
            return invalid("pipeline.poll_interval_ms must be positive");
        }
        if self.framing.max_frame_len == 0 {
            return invalid("framing.max_frame_len must be positive");
        }
        if let Some(secs) = self.tracker.retention_secs {
            let needed = self.linker.inactive_after_ms + self.linker.max_gap_ms;
            if secs.saturating_mul(1000) < needed {
                return Err(ConfigError::Invalid(format!(
                    "tracker.retention_secs ({secs}s) must cover linker.inactive_after_ms + linker.max_gap_ms ({needed}ms)"
                )));
            }
        }
        self.layout.to_layout()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.poll_interval_ms)
    }
}
