// Storage writer - puts an image into an inactive slot and repoints boot
//
// begin -> append* -> finalize -> activate
//            \-> abort (any time before activate)
//
// `activate` only exists on a finalized image, so an unvalidated slot can
// never become the boot target.

use super::error::StorageError;
use super::partition::Slot;

pub trait StorageWriter {
    type Session: WriteSession;

    /// Prepare `slot` for sequential writing (erasing as needed). Must refuse
    /// the currently booted slot.
    fn begin(&mut self, slot: &Slot) -> Result<Self::Session, StorageError>;
}

pub trait WriteSession {
    type Finalized: FinalizedImage;

    /// Write the whole chunk at the current offset, or nothing at all
    fn append(&mut self, chunk: &[u8]) -> Result<(), StorageError>;

    fn bytes_written(&self) -> u64;

    /// Validate everything written. On failure the slot is left inert.
    fn finalize(self) -> Result<Self::Finalized, StorageError>;

    /// Discard the partial image. The boot pointer is untouched.
    fn abort(self);
}

pub trait FinalizedImage {
    /// Atomically repoint the boot pointer at this image. A power loss
    /// before this returns leaves the previous pointer in place.
    fn activate(self) -> Result<(), StorageError>;
}
