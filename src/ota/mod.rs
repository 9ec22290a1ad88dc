// OTA (Over-The-Air) update module

pub mod error;
pub mod image;
pub mod manager;
pub mod partition;
pub mod service;
pub mod status;
pub mod storage;
pub mod transport;

pub use error::{DirectoryError, StartError, StorageError, TransportError, UpdateError};
pub use manager::{OtaManager, UpdateOptions, UpdateReport, UpdateSession};
pub use partition::{PartitionDirectory, Slot, SlotRole};
pub use service::{Platform, UpdateHandle, UpdateService};
pub use status::{label_for_code, StatusRegister, UpdatePhase};

// OTA update flow:
// 1. Pick the next updatable slot (never the booted one)
// 2. Open the firmware stream
// 3. Begin a write session and stream chunks into it
// 4. Finalize (validate the image)
// 5. Set boot partition
// 6. Restart after a short grace period
