//! Acquisition configuration
//!
//! Loaded from JSON by hosts that persist settings; every field has a
//! default so partial documents are accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Buffers announced per session when nothing else is configured.
pub const DEFAULT_NUM_BUFFERS: usize = 3;

/// Environment variable that switches on per-buffer debug logging.
pub const LOG_BUFFER_ENV: &str = "QNTX_HARVEST_LOG_BUFFER";

/// Configuration for an acquisition engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Buffers announced per session (raised to the producer minimum)
    #[serde(default = "default_num_buffers")]
    pub num_buffers: usize,
    /// How many filled buffers wait for the consumer before dropping starts
    #[serde(default = "default_hold")]
    pub num_filled_buffers_to_hold: usize,
    /// Drop the oldest held buffer (true) or the newest delivery (false)
    #[serde(default = "default_true")]
    pub keep_latest: bool,
    /// Upper bound on one delivery-thread wait, in milliseconds
    #[serde(default = "default_acquisition_timeout")]
    pub timeout_for_image_acquisition_ms: u64,
    /// Pause between delivery iterations, in microseconds
    #[serde(default = "default_idle")]
    pub worker_idle_us: u64,
    /// Keep the producer's data stream open across sessions
    #[serde(default = "default_true")]
    pub keep_data_stream_open: bool,
    /// Parse chunk descriptors when a buffer is fetched
    #[serde(default = "default_true")]
    pub update_chunk_automatically: bool,
    /// Emit a debug line for every buffer movement
    #[serde(default = "default_log_buffers")]
    pub log_buffers: bool,
}

fn default_num_buffers() -> usize {
    DEFAULT_NUM_BUFFERS
}

fn default_hold() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_acquisition_timeout() -> u64 {
    100
}

fn default_idle() -> u64 {
    1
}

fn default_log_buffers() -> bool {
    std::env::var_os(LOG_BUFFER_ENV).is_some()
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            num_buffers: default_num_buffers(),
            num_filled_buffers_to_hold: default_hold(),
            keep_latest: true,
            timeout_for_image_acquisition_ms: default_acquisition_timeout(),
            worker_idle_us: default_idle(),
            keep_data_stream_open: true,
            update_chunk_automatically: true,
            log_buffers: default_log_buffers(),
        }
    }
}

impl AcquisitionConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| HarvestError::InvalidConfig(format!("JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_buffers == 0 {
            return Err(HarvestError::InvalidConfig(
                "num_buffers must be greater than 0".to_string(),
            ));
        }
        if self.num_filled_buffers_to_hold == 0 {
            return Err(HarvestError::InvalidConfig(
                "num_filled_buffers_to_hold must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_for_image_acquisition_ms)
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_micros(self.worker_idle_us)
    }
}
