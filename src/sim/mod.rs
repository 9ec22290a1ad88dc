//! Host-side stand-ins for the board: simulated flash and a scripted
//! firmware server. Used by the tests and the host dry-run CLI.

pub mod flash;
pub mod server;

use std::sync::atomic::{AtomicUsize, Ordering};

pub use flash::{FaultPlan, SimFlash, SimSlot, SlotState};
pub use server::{RecordedRequest, ScriptedServer, ScriptedStream};

use crate::ota::error::DirectoryError;
use crate::ota::partition::PartitionDirectory;
use crate::ota::service::Platform;
use crate::ota::transport::{Transport, TransportConfig};

pub struct SimPlatform<T = ScriptedServer> {
    flash: SimFlash,
    transport: T,
    version: String,
    restarts: AtomicUsize,
}

impl<T> SimPlatform<T> {
    pub fn new(flash: SimFlash, transport: T, version: impl Into<String>) -> Self {
        Self {
            flash,
            transport,
            version: version.into(),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn flash(&self) -> &SimFlash {
        &self.flash
    }

    pub fn transport_handle(&self) -> &T {
        &self.transport
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl<T> Platform for SimPlatform<T>
where
    T: Transport + Clone + Send + Sync + 'static,
{
    type Transport = T;
    type Storage = SimFlash;

    fn transport(&self, config: &TransportConfig) -> T {
        log::debug!("Simulated transport, timeout {:?}, keep-alive {}", config.timeout, config.keep_alive);
        self.transport.clone()
    }

    fn storage(&self) -> SimFlash {
        self.flash.clone()
    }

    fn partition_directory(&self) -> Result<PartitionDirectory, DirectoryError> {
        self.flash.directory()
    }

    fn running_version(&self) -> String {
        self.version.clone()
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        log::info!("Simulated restart, next boot from slot {}", self.flash.boot_index());
    }
}
