// OTA failure taxonomy. Every variant is terminal for the run that hit it.

use thiserror::Error;

use super::status::UpdatePhase;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("read failed: {0}")]
    Read(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot begin write to slot {slot}: {reason}")]
    Begin { slot: usize, reason: String },
    #[error("write of {len} bytes at offset {offset} failed: {reason}")]
    Write { offset: u64, len: usize, reason: String },
    #[error("image validation failed: {0}")]
    Validate(String),
    #[error("could not set boot slot {slot}: {reason}")]
    SetBoot { slot: usize, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("partition table is empty")]
    Empty,
    #[error("expected exactly one booted slot, found {0}")]
    BootedCount(usize),
    #[error("no updatable slot distinct from slot {0}")]
    NoPartition(usize),
}

/// Why an update run ended without installing a new image
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no update partition: {0}")]
    NoPartition(#[from] DirectoryError),
    #[error("transport open failed: {0}")]
    Connect(#[source] TransportError),
    #[error("begin session failed: {0}")]
    BeginSession(#[source] StorageError),
    #[error("download read failed: {0}")]
    Read(#[source] TransportError),
    #[error("flash write failed: {0}")]
    Write(#[source] StorageError),
    #[error("finalize failed: {0}")]
    Validate(#[source] StorageError),
    #[error("activate failed: {0}")]
    SetBoot(#[source] StorageError),
}

impl UpdateError {
    /// Terminal status recorded for this failure
    pub fn phase(&self) -> UpdatePhase {
        match self {
            UpdateError::NoPartition(_) => UpdatePhase::FailedNoPartition,
            UpdateError::Connect(_) => UpdatePhase::FailedConnect,
            UpdateError::BeginSession(_) => UpdatePhase::FailedBeginSession,
            UpdateError::Read(_) => UpdatePhase::FailedRead,
            UpdateError::Write(_) => UpdatePhase::FailedWrite,
            UpdateError::Validate(_) => UpdatePhase::FailedValidate,
            UpdateError::SetBoot(_) => UpdatePhase::FailedSetBoot,
        }
    }
}

/// Rejections from the update trigger itself
#[derive(Debug, Error)]
pub enum StartError {
    #[error("an update session is already active")]
    AlreadyActive,
    #[error("failed to spawn update task: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn each_failure_maps_to_its_own_phase() {
        let errors = [
            UpdateError::NoPartition(DirectoryError::NoPartition(0)),
            UpdateError::Connect(TransportError::Status(404)),
            UpdateError::BeginSession(StorageError::Begin { slot: 1, reason: "erase".into() }),
            UpdateError::Read(TransportError::Read("reset".into())),
            UpdateError::Write(StorageError::Write { offset: 0, len: 4, reason: "full".into() }),
            UpdateError::Validate(StorageError::Validate("magic".into())),
            UpdateError::SetBoot(StorageError::SetBoot { slot: 1, reason: "otadata".into() }),
        ];
        let phases: HashSet<_> = errors.iter().map(UpdateError::phase).collect();
        assert!(phases.iter().all(|p| p.is_failure()));
        assert_eq!(phases.len(), errors.len());
    }

    #[test]
    fn messages_carry_the_cause() {
        let err = UpdateError::Connect(TransportError::Status(503));
        assert_eq!(err.to_string(), "transport open failed: HTTP status 503");
    }
}
