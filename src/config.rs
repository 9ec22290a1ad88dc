use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ota::transport::TransportConfig;

pub const CONFIG_NAMESPACE: &str = "ota";
pub const CONFIG_KEY: &str = "config";

/// Largest config blob we accept from NVS or disk
pub const MAX_CONFIG_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    // Where to fetch firmware from
    pub firmware_url: String,

    // Streaming
    pub chunk_size: usize,
    pub http_timeout_ms: u64,
    pub keep_alive: bool,
    pub stall_retry_ms: u64,

    // Restart after a successful update
    pub restart_grace_ms: u64,

    // Status surface
    pub status_read_timeout_ms: u64,
    pub display_interval_ms: u64,

    // Leave the device alone if the server offers the version we run
    pub skip_same_version: bool,

    pub log_level: String,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            // Baked in by build.rs from FIRMWARE_UPGRADE_URL, may be empty
            firmware_url: env!("FIRMWARE_UPGRADE_URL").to_string(),
            chunk_size: 2048,
            http_timeout_ms: 15_000,
            keep_alive: true,
            stall_retry_ms: 1_000,
            restart_grace_ms: 2_000,
            status_read_timeout_ms: 50,
            display_interval_ms: 3_000,
            skip_same_version: false,
            log_level: "info".to_string(),
        }
    }
}

impl OtaConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_CONFIG_SIZE {
            bail!("config blob is {} bytes, limit is {}", bytes.len(), MAX_CONFIG_SIZE);
        }
        let config: OtaConfig = serde_json::from_slice(bytes).context("invalid OTA config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be non-zero");
        }
        if self.http_timeout_ms == 0 {
            bail!("http_timeout_ms must be non-zero");
        }
        if self.status_read_timeout_ms == 0 {
            bail!("status_read_timeout_ms must be non-zero");
        }
        if !self.firmware_url.is_empty() && !is_supported_url(&self.firmware_url) {
            bail!("unsupported firmware URL: {}", self.firmware_url);
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_millis(self.http_timeout_ms),
            keep_alive: self.keep_alive,
        }
    }

    pub fn stall_retry(&self) -> Duration {
        Duration::from_millis(self.stall_retry_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn status_read_timeout(&self) -> Duration {
        Duration::from_millis(self.status_read_timeout_ms)
    }

    pub fn display_interval(&self) -> Duration {
        Duration::from_millis(self.display_interval_ms)
    }
}

pub fn is_supported_url(url: &str) -> bool {
    ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

/// Parse a stored blob, falling back to defaults when it is missing or bad
pub fn load_or_default(stored: Option<&[u8]>) -> OtaConfig {
    match stored {
        Some(bytes) => match OtaConfig::from_json(bytes) {
            Ok(config) => {
                log::info!("Loaded OTA configuration");
                config
            }
            Err(e) => {
                log::warn!("Stored OTA config unusable: {:?}, using defaults", e);
                OtaConfig::default()
            }
        },
        None => {
            log::info!("No stored OTA config, using defaults");
            OtaConfig::default()
        }
    }
}
