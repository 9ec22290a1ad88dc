// Partition directory - catalog of application slots, fixed for the life of the boot

use core::fmt;

use super::error::DirectoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    /// The slot the boot pointer named at power-up
    Booted,
    /// An OTA slot that may receive a new image
    Updatable,
    /// Factory/test images and anything else we never write
    Other,
}

/// One storage region able to hold a complete firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
    pub label: String,
    pub address: u32,
    pub size: u32,
    pub role: SlotRole,
}

impl Slot {
    pub fn new(index: usize, label: impl Into<String>, address: u32, size: u32, role: SlotRole) -> Self {
        Self {
            index,
            label: label.into(),
            address,
            size,
            role,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (#{}, offset 0x{:x}, size 0x{:x})",
            self.label, self.index, self.address, self.size
        )
    }
}

#[derive(Debug, Clone)]
pub struct PartitionDirectory {
    slots: Vec<Slot>,
    booted: usize,
}

impl PartitionDirectory {
    /// Build from a table in flash order. Exactly one slot must be booted.
    pub fn new(slots: Vec<Slot>) -> Result<Self, DirectoryError> {
        if slots.is_empty() {
            return Err(DirectoryError::Empty);
        }
        let booted: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.role == SlotRole::Booted)
            .map(|(pos, _)| pos)
            .collect();
        if booted.len() != 1 {
            return Err(DirectoryError::BootedCount(booted.len()));
        }
        Ok(Self {
            slots,
            booted: booted[0],
        })
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn booted_slot(&self) -> &Slot {
        &self.slots[self.booted]
    }

    /// First updatable slot after `current` in table order, wrapping around.
    /// Never returns `current` itself.
    pub fn next_updatable_slot(&self, current: &Slot) -> Result<Slot, DirectoryError> {
        let start = self
            .slots
            .iter()
            .position(|slot| slot.index == current.index)
            .unwrap_or(self.slots.len() - 1);

        (1..self.slots.len())
            .map(|step| &self.slots[(start + step) % self.slots.len()])
            .find(|slot| slot.role == SlotRole::Updatable && slot.index != current.index)
            .cloned()
            .ok_or(DirectoryError::NoPartition(current.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(roles: &[SlotRole]) -> Vec<Slot> {
        roles
            .iter()
            .enumerate()
            .map(|(i, role)| Slot::new(i, format!("app{}", i), 0x10000 + (i as u32) * 0x100000, 0x100000, *role))
            .collect()
    }

    #[test]
    fn rejects_tables_without_a_single_booted_slot() {
        assert_eq!(PartitionDirectory::new(vec![]).unwrap_err(), DirectoryError::Empty);
        let none = table(&[SlotRole::Updatable, SlotRole::Updatable]);
        assert_eq!(PartitionDirectory::new(none).unwrap_err(), DirectoryError::BootedCount(0));
        let two = table(&[SlotRole::Booted, SlotRole::Booted]);
        assert_eq!(PartitionDirectory::new(two).unwrap_err(), DirectoryError::BootedCount(2));
    }

    #[test]
    fn picks_the_other_ota_slot() {
        let dir = PartitionDirectory::new(table(&[SlotRole::Other, SlotRole::Booted, SlotRole::Updatable])).unwrap();
        let booted = dir.booted_slot().clone();
        assert_eq!(booted.index, 1);
        assert_eq!(dir.next_updatable_slot(&booted).unwrap().index, 2);
    }

    #[test]
    fn wraps_around_the_table() {
        let dir = PartitionDirectory::new(table(&[
            SlotRole::Other,
            SlotRole::Updatable,
            SlotRole::Updatable,
            SlotRole::Booted,
        ]))
        .unwrap();
        assert_eq!(dir.next_updatable_slot(dir.booted_slot()).unwrap().index, 1);
    }

    #[test]
    fn single_slot_has_no_partition() {
        let dir = PartitionDirectory::new(table(&[SlotRole::Booted])).unwrap();
        assert_eq!(
            dir.next_updatable_slot(dir.booted_slot()).unwrap_err(),
            DirectoryError::NoPartition(0)
        );
        let factory_only = PartitionDirectory::new(table(&[SlotRole::Booted, SlotRole::Other])).unwrap();
        assert!(factory_only.next_updatable_slot(factory_only.booted_slot()).is_err());
    }

    fn role() -> impl Strategy<Value = SlotRole> {
        prop_oneof![Just(SlotRole::Updatable), Just(SlotRole::Other)]
    }

    proptest! {
        #[test]
        fn never_selects_the_booted_slot(
            mut roles in proptest::collection::vec(role(), 1..12),
            booted_at in 0usize..12,
        ) {
            let booted_at = booted_at % (roles.len() + 1);
            roles.insert(booted_at, SlotRole::Booted);
            let dir = PartitionDirectory::new(table(&roles)).unwrap();
            let booted = dir.booted_slot().clone();

            match dir.next_updatable_slot(&booted) {
                Ok(slot) => {
                    prop_assert_ne!(slot.index, booted.index);
                    prop_assert_eq!(slot.role, SlotRole::Updatable);
                }
                Err(err) => {
                    prop_assert!(!roles.contains(&SlotRole::Updatable));
                    prop_assert_eq!(err, DirectoryError::NoPartition(booted.index));
                }
            }
            // Side-effect free: asking again gives the same answer
            prop_assert_eq!(dir.next_updatable_slot(&booted).ok(), dir.next_updatable_slot(&booted).ok());
        }
    }
}
