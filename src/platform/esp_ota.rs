// ESP-IDF OTA backend - partition table, esp_ota_* writes, boot pointer

use core::ffi::c_void;
use std::ffi::CStr;

use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_boot_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_find,
    esp_partition_get, esp_partition_iterator_release, esp_partition_next,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MAX,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, EspError, ESP_ERR_OTA_VALIDATE_FAILED,
    OTA_SIZE_UNKNOWN,
};

use crate::ota::error::{DirectoryError, StorageError};
use crate::ota::partition::{PartitionDirectory, Slot, SlotRole};
use crate::ota::storage::{FinalizedImage, StorageWriter, WriteSession};

// Application partitions in table order. The pointers refer to the
// partition table mapped by the bootloader and stay valid until reset.
fn app_partitions() -> Vec<*const esp_partition_t> {
    let mut found = Vec::new();
    unsafe {
        let mut it = esp_partition_find(
            esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            core::ptr::null(),
        );
        while !it.is_null() {
            found.push(esp_partition_get(it));
            it = esp_partition_next(it);
        }
        esp_partition_iterator_release(it);
    }
    found
}

fn is_ota_subtype(partition: &esp_partition_t) -> bool {
    (esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN
        ..esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MAX)
        .contains(&partition.subtype)
}

fn partition_label(partition: &esp_partition_t) -> String {
    unsafe { CStr::from_ptr(partition.label.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Build the directory from the flash partition table and the boot pointer
pub fn load_partition_directory() -> Result<PartitionDirectory, DirectoryError> {
    let boot = unsafe { esp_ota_get_boot_partition() };
    let slots = app_partitions()
        .into_iter()
        .enumerate()
        .map(|(index, ptr)| {
            let partition = unsafe { &*ptr };
            let role = if ptr == boot {
                SlotRole::Booted
            } else if is_ota_subtype(partition) {
                SlotRole::Updatable
            } else {
                SlotRole::Other
            };
            log::debug!(
                "App partition {}: type {}, subtype {}, offset 0x{:x}, size 0x{:x}",
                partition_label(partition),
                partition.type_,
                partition.subtype,
                partition.address,
                partition.size
            );
            Slot::new(index, partition_label(partition), partition.address, partition.size, role)
        })
        .collect();
    PartitionDirectory::new(slots)
}

fn find_partition(slot: &Slot) -> Option<*const esp_partition_t> {
    app_partitions()
        .into_iter()
        .find(|ptr| unsafe { (**ptr).address } == slot.address)
}

/// Writes images through the ESP-IDF OTA API
#[derive(Debug, Default, Clone, Copy)]
pub struct EspOtaStorage;

impl StorageWriter for EspOtaStorage {
    type Session = EspOtaSession;

    fn begin(&mut self, slot: &Slot) -> Result<EspOtaSession, StorageError> {
        let refuse = |reason: String| StorageError::Begin {
            slot: slot.index,
            reason,
        };
        if slot.role == SlotRole::Booted {
            return Err(refuse("slot is booted".into()));
        }
        let partition = find_partition(slot).ok_or_else(|| refuse("partition not found".into()))?;

        let mut handle: esp_ota_handle_t = 0;
        // Erases the target partition; refuses the running one
        esp!(unsafe { esp_ota_begin(partition, OTA_SIZE_UNKNOWN as _, &mut handle) })
            .map_err(|e| refuse(format!("esp_ota_begin failed ({})", e)))?;

        log::info!("esp_ota_begin succeeded for {}", slot.label);
        Ok(EspOtaSession {
            handle: Some(handle),
            partition,
            slot: slot.index,
            written: 0,
        })
    }
}

pub struct EspOtaSession {
    handle: Option<esp_ota_handle_t>,
    partition: *const esp_partition_t,
    slot: usize,
    written: u64,
}

impl WriteSession for EspOtaSession {
    type Finalized = EspOtaImage;

    fn append(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let fail = |reason: String| StorageError::Write {
            offset: self.written,
            len: chunk.len(),
            reason,
        };
        let handle = self.handle.ok_or_else(|| fail("session closed".into()))?;
        esp!(unsafe { esp_ota_write(handle, chunk.as_ptr() as *const c_void, chunk.len()) })
            .map_err(|e| fail(format!("esp_ota_write failed ({})", e)))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn finalize(mut self) -> Result<EspOtaImage, StorageError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| StorageError::Validate("session closed".into()))?;

        // esp_ota_end releases the handle whether or not the image is valid
        esp!(unsafe { esp_ota_end(handle) }).map_err(|e: EspError| {
            if e.code() == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
                StorageError::Validate("image validation failed, firmware may be corrupt or improperly signed".into())
            } else {
                StorageError::Validate(format!("esp_ota_end failed ({})", e))
            }
        })?;

        Ok(EspOtaImage {
            partition: self.partition,
            slot: self.slot,
        })
    }

    fn abort(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = esp!(unsafe { esp_ota_abort(handle) }) {
                log::warn!("esp_ota_abort failed: {}", e);
            }
        }
    }
}

impl Drop for EspOtaSession {
    fn drop(&mut self) {
        // Clean up any ongoing OTA operation
        if let Some(handle) = self.handle.take() {
            unsafe {
                esp_ota_abort(handle);
            }
        }
    }
}

pub struct EspOtaImage {
    partition: *const esp_partition_t,
    slot: usize,
}

impl FinalizedImage for EspOtaImage {
    fn activate(self) -> Result<(), StorageError> {
        // otadata is written with a sequence number and CRC; a torn write
        // leaves the bootloader on the previous entry
        esp!(unsafe { esp_ota_set_boot_partition(self.partition) }).map_err(|e| StorageError::SetBoot {
            slot: self.slot,
            reason: format!("esp_ota_set_boot_partition failed ({})", e),
        })
    }
}
