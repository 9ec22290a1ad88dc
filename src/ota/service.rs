// Update trigger - runs one OTA session on its own task and owns the
// "session already active" guard

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::error::{DirectoryError, StartError, UpdateError};
use super::manager::{OtaManager, UpdateOptions, UpdateReport};
use super::partition::PartitionDirectory;
use super::status::{StatusRegister, UpdatePhase};
use super::storage::StorageWriter;
use super::transport::{Transport, TransportConfig};
use crate::config::OtaConfig;

#[cfg(target_os = "espidf")]
const OTA_TASK_STACK_SIZE: usize = 8 * 1024;
#[cfg(not(target_os = "espidf"))]
const OTA_TASK_STACK_SIZE: usize = 256 * 1024;

/// Board services the update task needs. Backends are created on the update
/// task itself, so they do not have to be `Send`.
pub trait Platform: Send + Sync + 'static {
    type Transport: Transport;
    type Storage: StorageWriter;

    fn transport(&self, config: &TransportConfig) -> Self::Transport;
    fn storage(&self) -> Self::Storage;
    fn partition_directory(&self) -> Result<PartitionDirectory, DirectoryError>;
    fn running_version(&self) -> String;

    /// Reboot into the new boot slot. Does not return on hardware.
    fn restart(&self);
}

pub type UpdateHandle = JoinHandle<Result<UpdateReport, UpdateError>>;

pub struct UpdateService<P: Platform> {
    platform: Arc<P>,
    status: Arc<StatusRegister>,
    config: OtaConfig,
    active: Arc<AtomicBool>,
}

// Clears the active flag when the update task finishes, however it finishes
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P: Platform> UpdateService<P> {
    pub fn new(platform: Arc<P>, status: Arc<StatusRegister>, config: OtaConfig) -> Self {
        Self {
            platform,
            status,
            config,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status(&self) -> &Arc<StatusRegister> {
        &self.status
    }

    pub fn get_status(&self) -> Option<UpdatePhase> {
        self.status.get()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Spawn the update task. Rejected without touching the status register
    /// while another session is still running.
    pub fn start_update(&self, url: impl Into<String>) -> Result<UpdateHandle, StartError> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| StartError::AlreadyActive)?;
        let guard = ActiveGuard(Arc::clone(&self.active));

        self.status.set(UpdatePhase::Idle);

        let url = url.into();
        let platform = Arc::clone(&self.platform);
        let status = Arc::clone(&self.status);
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("ota_task".into())
            .stack_size(OTA_TASK_STACK_SIZE)
            .spawn(move || {
                let _guard = guard;
                run_update(platform.as_ref(), status, &config, &url)
            })?;

        log::info!("OTA task created");
        Ok(handle)
    }
}

fn run_update<P: Platform>(
    platform: &P,
    status: Arc<StatusRegister>,
    config: &OtaConfig,
    url: &str,
) -> Result<UpdateReport, UpdateError> {
    // Reading the partition table is part of starting; a bad table must not
    // jump straight from Idle to a failure
    status.set(UpdatePhase::Starting);
    let directory = match platform.partition_directory() {
        Ok(directory) => directory,
        Err(e) => {
            let err = UpdateError::NoPartition(e);
            status.set(err.phase());
            log::error!("OTA failed: {}", err);
            return Err(err);
        }
    };

    let options = UpdateOptions::from_config(config, &platform.running_version());
    let mut manager = OtaManager::new(
        platform.transport(&config.transport()),
        platform.storage(),
        directory,
        status,
        options,
    );
    let report = manager.run(url)?;

    if report.phase == UpdatePhase::SuccessRestarting {
        log::info!("Restarting into {} in {:?}", report.slot.label, config.restart_grace());
        thread::sleep(config.restart_grace());
        log::logger().flush();
        platform.restart();
    }
    Ok(report)
}
