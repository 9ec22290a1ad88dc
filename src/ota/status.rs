// OTA status register - the only OTA state shared outside the update task

use core::fmt;
use parking_lot::Mutex;
use std::time::Duration;

/// Default bound for status readers (display loop, telemetry)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Label shown for a raw status code outside the known set
pub const UNKNOWN_LABEL: &str = "OTA: Unknown";

/// Stage of the update protocol as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UpdatePhase {
    Idle = 0,
    Starting = 1,
    CheckingFirmware = 2,
    Downloading = 3,
    WritingStorage = 4,
    Validating = 5,
    SuccessRestarting = 6,
    FailedNoPartition = 7,
    FailedConnect = 8,
    FailedBeginSession = 9,
    FailedRead = 10,
    FailedWrite = 11,
    FailedValidate = 12,
    FailedSetBoot = 13,
    NoUpdateAvailable = 14,
}

impl UpdatePhase {
    pub const ALL: [UpdatePhase; 15] = [
        UpdatePhase::Idle,
        UpdatePhase::Starting,
        UpdatePhase::CheckingFirmware,
        UpdatePhase::Downloading,
        UpdatePhase::WritingStorage,
        UpdatePhase::Validating,
        UpdatePhase::SuccessRestarting,
        UpdatePhase::FailedNoPartition,
        UpdatePhase::FailedConnect,
        UpdatePhase::FailedBeginSession,
        UpdatePhase::FailedRead,
        UpdatePhase::FailedWrite,
        UpdatePhase::FailedValidate,
        UpdatePhase::FailedSetBoot,
        UpdatePhase::NoUpdateAvailable,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Short label sized for a 16 column character display
    pub fn label(self) -> &'static str {
        match self {
            UpdatePhase::Idle => "OTA: Ready",
            UpdatePhase::Starting => "OTA: Starting",
            UpdatePhase::CheckingFirmware => "OTA: Checking FW",
            UpdatePhase::Downloading => "OTA: Download...",
            UpdatePhase::WritingStorage => "OTA: Writing...",
            UpdatePhase::Validating => "OTA: Validating",
            UpdatePhase::SuccessRestarting => "OTA: OK, reboot",
            UpdatePhase::FailedNoPartition => "OTA ERR: Slot",
            UpdatePhase::FailedConnect => "OTA ERR: HTTP",
            UpdatePhase::FailedBeginSession => "OTA ERR: Begin",
            UpdatePhase::FailedRead => "OTA ERR: Read",
            UpdatePhase::FailedWrite => "OTA ERR: Write",
            UpdatePhase::FailedValidate => "OTA ERR: Verify",
            UpdatePhase::FailedSetBoot => "OTA ERR: SetBoot",
            UpdatePhase::NoUpdateAvailable => "OTA: Up to date",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            UpdatePhase::FailedNoPartition
                | UpdatePhase::FailedConnect
                | UpdatePhase::FailedBeginSession
                | UpdatePhase::FailedRead
                | UpdatePhase::FailedWrite
                | UpdatePhase::FailedValidate
                | UpdatePhase::FailedSetBoot
        )
    }

    /// A run that reached this phase will not change it again
    pub fn is_terminal(self) -> bool {
        self.is_failure()
            || matches!(
                self,
                UpdatePhase::SuccessRestarting | UpdatePhase::NoUpdateAvailable
            )
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Label for a raw status code, e.g. one read back from shared memory
pub fn label_for_code(code: u8) -> &'static str {
    UpdatePhase::from_code(code)
        .map(UpdatePhase::label)
        .unwrap_or(UNKNOWN_LABEL)
}

/// Lock-guarded holder of the current update phase.
///
/// Writers wait for the lock as long as it takes; writes are rare and must
/// never be lost. Readers give up after `read_timeout` and get `None`, so a
/// display loop keeps showing its previous value instead of stalling.
pub struct StatusRegister {
    phase: Mutex<UpdatePhase>,
    read_timeout: Duration,
}

impl StatusRegister {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            phase: Mutex::new(UpdatePhase::Idle),
            read_timeout,
        }
    }

    pub fn set(&self, phase: UpdatePhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            log::debug!("OTA status: {:?} -> {:?}", *current, phase);
        }
        *current = phase;
    }

    /// Read with the configured short timeout
    pub fn get(&self) -> Option<UpdatePhase> {
        self.get_timeout(self.read_timeout)
    }

    pub fn get_timeout(&self, timeout: Duration) -> Option<UpdatePhase> {
        self.phase.try_lock_for(timeout).map(|guard| *guard)
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

impl Default for StatusRegister {
    fn default() -> Self {
        Self::new(DEFAULT_READ_TIMEOUT)
    }
}
