//! USB Video Class streaming engine.
//!
//! Parses UVC descriptors, negotiates a stream with probe/commit, keeps a
//! pool of isochronous or bulk transfers in flight, reassembles payloads
//! into frames and decodes them off the completion path.

pub mod capture;
pub mod descriptor;
pub mod error;
pub mod pipeline;
pub mod stream;
pub mod usb;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::decoder::OutputFormat;
use crate::error::ConfigError;

pub use crate::capture::decoder::Codecs;
pub use crate::error::{Result, StreamError, StreamFault};
pub use crate::pipeline::{StatsSnapshot, StreamEvent};
pub use crate::stream::{Preset, StreamConfig, StreamController, StreamRequest, StreamState};
pub use crate::usb::UsbTransport;

/// Prefix for environment overrides, e.g. `UVCSTREAM__TRANSFER__ACTIVE_URBS=64`.
pub const ENV_PREFIX: &str = "UVCSTREAM";

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Used when `open` is called with an empty request
    pub stream: StreamRequest,
    /// Used when both the request and `stream` are empty
    pub preset: Option<Preset>,
    pub transfer: TransferConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub active_urbs: usize,
    /// Unset: the selected alternate setting's capacity
    pub max_packet_size: Option<usize>,
    pub packets_per_request: usize,
    pub cancel_timeout_ms: u64,
    pub control_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Completed frames waiting for the decoder (2..=4)
    pub queue_capacity: usize,
    pub max_consecutive_decode_errors: u32,
    pub output_format: OutputFormat,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            active_urbs: 32,
            max_packet_size: None,
            packets_per_request: 32,
            cancel_timeout_ms: 2000,
            control_timeout_ms: 1000,
        }
    }
}

impl TransferConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 3,
            max_consecutive_decode_errors: 10,
            output_format: OutputFormat::Native,
        }
    }
}

impl EngineConfig {
    /// Defaults, then `path` (TOML) if given, then `UVCSTREAM__*` variables.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(2..=4).contains(&self.pipeline.queue_capacity) {
            return Err(ConfigError::Invalid(format!(
                "pipeline.queue_capacity must be between 2 and 4, got {}",
                self.pipeline.queue_capacity
            )));
        }
        if self.transfer.active_urbs == 0 || self.transfer.packets_per_request == 0 {
            return Err(ConfigError::Invalid(
                "transfer.active_urbs and transfer.packets_per_request must be non-zero".into(),
            ));
        }
        if self.pipeline.max_consecutive_decode_errors == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_consecutive_decode_errors must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
