// In-memory flash with an OTA partition table and a persistent boot pointer

use parking_lot::Mutex;
use std::sync::Arc;

use crate::ota::error::{DirectoryError, StorageError};
use crate::ota::image;
use crate::ota::partition::{PartitionDirectory, Slot, SlotRole};
use crate::ota::storage::{FinalizedImage, StorageWriter, WriteSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Writing,
    /// Written but failed validation or was discarded; never bootable
    Inert,
    Valid,
}

/// Injected storage failures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    pub fail_begin: bool,
    /// Zero-based append call that fails
    pub fail_append_at: Option<usize>,
    pub fail_validate: bool,
    pub fail_set_boot: bool,
}

#[derive(Debug, Clone)]
pub struct SimSlot {
    pub label: String,
    pub address: u32,
    pub size: u32,
    pub ota: bool,
}

#[derive(Debug)]
struct FlashState {
    layout: Vec<SimSlot>,
    data: Vec<Vec<u8>>,
    states: Vec<SlotState>,
    boot_index: usize,
    faults: FaultPlan,
    append_calls: usize,
    open_sessions: usize,
    aborts: usize,
}

#[derive(Debug, Clone)]
pub struct SimFlash {
    inner: Arc<Mutex<FlashState>>,
}

impl SimFlash {
    pub fn new(layout: Vec<SimSlot>, boot_index: usize) -> Self {
        let count = layout.len();
        Self {
            inner: Arc::new(Mutex::new(FlashState {
                layout,
                data: vec![Vec::new(); count],
                states: vec![SlotState::Empty; count],
                boot_index,
                faults: FaultPlan::default(),
                append_calls: 0,
                open_sessions: 0,
                aborts: 0,
            })),
        }
    }

    /// factory + ota_0 + ota_1, booted from ota_0
    pub fn two_slot(slot_size: u32) -> Self {
        let slot = |label: &str, address: u32, ota: bool| SimSlot {
            label: label.to_string(),
            address,
            size: slot_size,
            ota,
        };
        Self::new(
            vec![
                slot("factory", 0x10000, false),
                slot("ota_0", 0x10000 + slot_size, true),
                slot("ota_1", 0x10000 + 2 * slot_size, true),
            ],
            1,
        )
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.inner.lock().faults = faults;
    }

    /// Partition table as the bootloader would present it after a reset
    pub fn directory(&self) -> Result<PartitionDirectory, DirectoryError> {
        let state = self.inner.lock();
        let slots = state
            .layout
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let role = if index == state.boot_index {
                    SlotRole::Booted
                } else if slot.ota {
                    SlotRole::Updatable
                } else {
                    SlotRole::Other
                };
                Slot::new(index, slot.label.clone(), slot.address, slot.size, role)
            })
            .collect();
        PartitionDirectory::new(slots)
    }

    pub fn boot_index(&self) -> usize {
        self.inner.lock().boot_index
    }

    pub fn slot_state(&self, index: usize) -> SlotState {
        self.inner.lock().states[index]
    }

    pub fn slot_data(&self, index: usize) -> Vec<u8> {
        self.inner.lock().data[index].clone()
    }

    pub fn append_calls(&self) -> usize {
        self.inner.lock().append_calls
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().open_sessions
    }

    pub fn aborts(&self) -> usize {
        self.inner.lock().aborts
    }
}

impl StorageWriter for SimFlash {
    type Session = SimSession;

    fn begin(&mut self, slot: &Slot) -> Result<SimSession, StorageError> {
        let mut state = self.inner.lock();
        let refuse = |reason: &str| StorageError::Begin {
            slot: slot.index,
            reason: reason.to_string(),
        };

        if state.faults.fail_begin {
            return Err(refuse("injected begin failure"));
        }
        if slot.index >= state.layout.len() {
            return Err(refuse("no such slot"));
        }
        if slot.index == state.boot_index {
            return Err(refuse("slot is booted"));
        }
        if !state.layout[slot.index].ota {
            return Err(refuse("not an OTA slot"));
        }

        let capacity = state.layout[slot.index].size as u64;
        state.data[slot.index].clear();
        state.states[slot.index] = SlotState::Writing;
        state.open_sessions += 1;

        Ok(SimSession {
            flash: self.clone(),
            slot: slot.index,
            capacity,
            written: 0,
        })
    }
}

pub struct SimSession {
    flash: SimFlash,
    slot: usize,
    capacity: u64,
    written: u64,
}

impl SimSession {
    fn close(&self, state: &mut FlashState) {
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

impl WriteSession for SimSession {
    type Finalized = SimImage;

    fn append(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let mut state = self.flash.inner.lock();
        let call = state.append_calls;
        state.append_calls += 1;

        let fail = |reason: &str| StorageError::Write {
            offset: self.written,
            len: chunk.len(),
            reason: reason.to_string(),
        };
        if state.faults.fail_append_at == Some(call) {
            return Err(fail("injected write failure"));
        }
        if self.written + chunk.len() as u64 > self.capacity {
            return Err(fail("image larger than slot"));
        }

        state.data[self.slot].extend_from_slice(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn finalize(self) -> Result<SimImage, StorageError> {
        let mut state = self.flash.inner.lock();
        self.close(&mut state);

        let verdict = if state.faults.fail_validate {
            Err("injected validation failure".to_string())
        } else {
            image::validate(&state.data[self.slot]).map_err(|e| e.to_string())
        };
        match verdict {
            Ok(()) => {
                state.states[self.slot] = SlotState::Valid;
                Ok(SimImage {
                    flash: self.flash.clone(),
                    slot: self.slot,
                })
            }
            Err(reason) => {
                state.states[self.slot] = SlotState::Inert;
                Err(StorageError::Validate(reason))
            }
        }
    }

    fn abort(self) {
        let mut state = self.flash.inner.lock();
        self.close(&mut state);
        state.aborts += 1;
        state.data[self.slot].clear();
        state.states[self.slot] = SlotState::Inert;
    }
}

pub struct SimImage {
    flash: SimFlash,
    slot: usize,
}

impl FinalizedImage for SimImage {
    fn activate(self) -> Result<(), StorageError> {
        let mut state = self.flash.inner.lock();
        let refuse = |reason: &str| StorageError::SetBoot {
            slot: self.slot,
            reason: reason.to_string(),
        };
        if state.faults.fail_set_boot {
            return Err(refuse("injected otadata write failure"));
        }
        if state.states[self.slot] != SlotState::Valid {
            return Err(refuse("image not validated"));
        }
        // Single store: the pointer is either the old slot or the new one
        state.boot_index = self.slot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::image::synthesize;

    #[test]
    fn booted_slot_cannot_be_opened() {
        let mut flash = SimFlash::two_slot(0x10000);
        let dir = flash.directory().unwrap();
        let err = flash.begin(dir.booted_slot()).err().unwrap();
        assert!(matches!(err, StorageError::Begin { slot: 1, .. }));
    }

    #[test]
    fn finalized_image_activates() {
        let mut flash = SimFlash::two_slot(0x10000);
        let dir = flash.directory().unwrap();
        let target = dir.next_updatable_slot(dir.booted_slot()).unwrap();

        let mut session = flash.begin(&target).unwrap();
        for chunk in synthesize("1.0.1", "node", 5000).chunks(1024) {
            session.append(chunk).unwrap();
        }
        assert_eq!(session.bytes_written(), 5000);
        session.finalize().unwrap().activate().unwrap();

        assert_eq!(flash.boot_index(), 2);
        assert_eq!(flash.slot_state(2), SlotState::Valid);
        assert_eq!(flash.open_sessions(), 0);
        assert_eq!(flash.directory().unwrap().booted_slot().label, "ota_1");
    }

    #[test]
    fn garbage_is_left_inert() {
        let mut flash = SimFlash::two_slot(0x10000);
        let dir = flash.directory().unwrap();
        let target = dir.next_updatable_slot(dir.booted_slot()).unwrap();

        let mut session = flash.begin(&target).unwrap();
        session.append(&[0u8; 512]).unwrap();
        assert!(matches!(session.finalize(), Err(StorageError::Validate(_))));
        assert_eq!(flash.slot_state(2), SlotState::Inert);
        assert_eq!(flash.boot_index(), 1);
    }

    #[test]
    fn oversized_image_is_a_write_error() {
        let mut flash = SimFlash::two_slot(1024);
        let dir = flash.directory().unwrap();
        let target = dir.next_updatable_slot(dir.booted_slot()).unwrap();

        let mut session = flash.begin(&target).unwrap();
        session.append(&[1u8; 1000]).unwrap();
        assert!(session.append(&[1u8; 100]).is_err());
        // All-or-nothing: the rejected chunk left no bytes behind
        assert_eq!(flash.slot_data(2).len(), 1000);
        session.abort();
        assert_eq!(flash.aborts(), 1);
        assert_eq!(flash.slot_state(2), SlotState::Inert);
    }
}
