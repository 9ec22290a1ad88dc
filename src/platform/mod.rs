//! ESP32 board services: HTTP client, OTA partitions, NVS config and reset.

pub mod esp_http;
pub mod esp_ota;

use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

pub use esp_http::{EspHttpStream, EspHttpTransport};
pub use esp_ota::{load_partition_directory, EspOtaStorage};

use crate::config::{self, OtaConfig, CONFIG_KEY, CONFIG_NAMESPACE, MAX_CONFIG_SIZE};
use crate::ota::error::DirectoryError;
use crate::ota::partition::PartitionDirectory;
use crate::ota::service::Platform;
use crate::ota::transport::TransportConfig;
use crate::version;

#[derive(Debug, Default, Clone, Copy)]
pub struct EspPlatform;

impl EspPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Platform for EspPlatform {
    type Transport = EspHttpTransport;
    type Storage = EspOtaStorage;

    fn transport(&self, config: &TransportConfig) -> EspHttpTransport {
        EspHttpTransport::new(*config)
    }

    fn storage(&self) -> EspOtaStorage {
        EspOtaStorage
    }

    fn partition_directory(&self) -> Result<PartitionDirectory, DirectoryError> {
        load_partition_directory()
    }

    fn running_version(&self) -> String {
        version::FIRMWARE_VERSION.to_string()
    }

    fn restart(&self) {
        log::warn!("Restarting system...");
        unsafe {
            esp_idf_sys::esp_restart();
        }
    }
}

/// Load the OTA config blob from NVS, defaults on any problem. Defaults are
/// written back when nothing usable was stored.
pub fn load_config(partition: EspDefaultNvsPartition) -> OtaConfig {
    let blob = match read_config_blob(partition.clone()) {
        Ok(blob) => blob,
        Err(e) => {
            log::warn!("Failed to open NVS namespace '{}': {:?}", CONFIG_NAMESPACE, e);
            None
        }
    };
    let config = config::load_or_default(blob.as_deref());

    let stored_ok = blob
        .as_deref()
        .map(|bytes| OtaConfig::from_json(bytes).is_ok())
        .unwrap_or(false);
    if !stored_ok {
        // Try to save default config to NVS for next time
        if let Err(e) = save_config(partition, &config) {
            log::warn!("Failed to save default OTA config to NVS: {:?}", e);
        }
    }
    config
}

fn read_config_blob(partition: EspDefaultNvsPartition) -> Result<Option<Vec<u8>>> {
    let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
    let mut buf = [0u8; MAX_CONFIG_SIZE];
    Ok(nvs.get_blob(CONFIG_KEY, &mut buf)?.map(|data| data.to_vec()))
}

pub fn save_config(partition: EspDefaultNvsPartition, config: &OtaConfig) -> Result<()> {
    config.validate()?;
    let mut nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
    let json = config.to_json()?;
    nvs.set_blob(CONFIG_KEY, &json)?;
    log::info!("OTA config saved ({} bytes)", json.len());
    Ok(())
}
