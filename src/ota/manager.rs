// OTA Manager - drives one update run from URL to boot pointer
//
// Every failure is written to the status register first, then the transport
// and storage session are released. The booted slot is never touched; the
// only irreversible step is `activate` on a validated image.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::error::{StorageError, UpdateError};
use super::image::AppDescriptor;
use super::partition::{PartitionDirectory, Slot};
use super::status::{StatusRegister, UpdatePhase};
use super::storage::{FinalizedImage, StorageWriter, WriteSession};
use super::transport::{ByteStream, Transport};
use crate::config::OtaConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    pub chunk_size: usize,
    pub stall_retry: Duration,
    /// Set to the running firmware version to skip images that match it
    pub running_version: Option<String>,
}

impl UpdateOptions {
    pub fn from_config(config: &OtaConfig, running_version: &str) -> Self {
        Self {
            chunk_size: config.chunk_size,
            stall_retry: config.stall_retry(),
            running_version: config.skip_same_version.then(|| running_version.to_string()),
        }
    }
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self::from_config(&OtaConfig::default(), "")
    }
}

/// How a run ended when nothing went wrong
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// `SuccessRestarting` or `NoUpdateAvailable`
    pub phase: UpdatePhase,
    pub slot: Slot,
    pub bytes_written: u64,
    pub declared_length: Option<u64>,
}

/// Single-owner record of an in-progress write. Dropping it with the writer
/// still open aborts the write.
pub struct UpdateSession<W: WriteSession> {
    target: Slot,
    writer: Option<W>,
    bytes_written: u64,
    chunk: Box<[u8]>,
}

impl<W: WriteSession> UpdateSession<W> {
    pub fn new(target: Slot, writer: W, chunk_size: usize) -> Self {
        Self {
            target,
            writer: Some(writer),
            bytes_written: 0,
            chunk: vec![0u8; chunk_size.max(1)].into_boxed_slice(),
        }
    }

    pub fn target(&self) -> &Slot {
        &self.target
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.chunk
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.chunk
    }

    /// Commit the first `len` bytes of the chunk buffer
    pub fn append(&mut self, len: usize) -> Result<(), StorageError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(StorageError::Write {
                offset: self.bytes_written,
                len,
                reason: "session closed".into(),
            });
        };
        writer.append(&self.chunk[..len])?;
        self.bytes_written += len as u64;
        Ok(())
    }

    pub fn finalize(mut self) -> Result<W::Finalized, StorageError> {
        match self.writer.take() {
            Some(writer) => writer.finalize(),
            None => Err(StorageError::Validate("session closed".into())),
        }
    }

    pub fn abort(mut self) {
        if let Some(writer) = self.writer.take() {
            log::info!("Aborting OTA write to {} after {} bytes", self.target.label, self.bytes_written);
            writer.abort();
        }
    }
}

impl<W: WriteSession> Drop for UpdateSession<W> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            log::warn!("OTA session for {} dropped while open, aborting", self.target.label);
            writer.abort();
        }
    }
}

enum Download {
    Complete,
    SameVersion,
}

pub struct OtaManager<T: Transport, S: StorageWriter> {
    transport: T,
    storage: S,
    directory: PartitionDirectory,
    status: Arc<StatusRegister>,
    options: UpdateOptions,
}

impl<T: Transport, S: StorageWriter> OtaManager<T, S> {
    pub fn new(
        transport: T,
        storage: S,
        directory: PartitionDirectory,
        status: Arc<StatusRegister>,
        options: UpdateOptions,
    ) -> Self {
        Self {
            transport,
            storage,
            directory,
            status,
            options,
        }
    }

    pub fn status(&self) -> &Arc<StatusRegister> {
        &self.status
    }

    /// Run the full update. Terminal status is left in the register.
    pub fn run(&mut self, url: &str) -> Result<UpdateReport, UpdateError> {
        log::info!("Starting OTA update from {}", url);
        self.status.set(UpdatePhase::Starting);

        let booted = self.directory.booted_slot();
        let target = match self.directory.next_updatable_slot(booted) {
            Ok(slot) => slot,
            Err(e) => return Err(self.fail(UpdateError::NoPartition(e))),
        };
        log::info!("Running from {}, update goes to {}", booted, target);

        self.status.set(UpdatePhase::CheckingFirmware);
        let mut stream = match self.transport.open(url) {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(UpdateError::Connect(e))),
        };
        let declared = stream.declared_length();
        match declared {
            Some(len) => log::info!("Estimated firmware size (Content-Length): {} bytes", len),
            None => log::info!("Server did not declare a firmware size"),
        }
        self.status.set(UpdatePhase::Downloading);

        let writer = match self.storage.begin(&target) {
            Ok(writer) => writer,
            Err(e) => {
                let err = self.fail(UpdateError::BeginSession(e));
                stream.close();
                return Err(err);
            }
        };
        let mut session = UpdateSession::new(target, writer, self.options.chunk_size);

        match self.download(&mut stream, &mut session, declared) {
            Ok(Download::Complete) => {}
            Ok(Download::SameVersion) => {
                self.status.set(UpdatePhase::NoUpdateAvailable);
                let report = UpdateReport {
                    phase: UpdatePhase::NoUpdateAvailable,
                    slot: session.target().clone(),
                    bytes_written: 0,
                    declared_length: declared,
                };
                session.abort();
                stream.close();
                return Ok(report);
            }
            Err(e) => {
                let err = self.fail(e);
                session.abort();
                stream.close();
                return Err(err);
            }
        }

        self.status.set(UpdatePhase::Validating);
        let slot = session.target().clone();
        let bytes_written = session.bytes_written();

        let image = match session.finalize() {
            Ok(image) => image,
            Err(e) => {
                let err = self.fail(UpdateError::Validate(e));
                stream.close();
                return Err(err);
            }
        };
        if let Err(e) = image.activate() {
            let err = self.fail(UpdateError::SetBoot(e));
            stream.close();
            return Err(err);
        }

        log::info!("OTA update successful ({} bytes), next boot from {}", bytes_written, slot);
        self.status.set(UpdatePhase::SuccessRestarting);
        stream.close();

        Ok(UpdateReport {
            phase: UpdatePhase::SuccessRestarting,
            slot,
            bytes_written,
            declared_length: declared,
        })
    }

    fn download(
        &self,
        stream: &mut T::Stream,
        session: &mut UpdateSession<S::Session>,
        declared: Option<u64>,
    ) -> Result<Download, UpdateError> {
        let mut writing = false;
        let mut next_report = 10u64;

        loop {
            let read = stream.read(session.buffer_mut()).map_err(UpdateError::Read)?;

            if read > 0 {
                if !writing && self.is_running_version(&session.buffer()[..read]) {
                    return Ok(Download::SameVersion);
                }
                session.append(read).map_err(UpdateError::Write)?;
                if !writing {
                    writing = true;
                    self.status.set(UpdatePhase::WritingStorage);
                    log::info!("Writing firmware to {}", session.target().label);
                }

                let written = session.bytes_written();
                match declared.filter(|total| *total > 0) {
                    Some(total) => {
                        let pct = (written.saturating_mul(100) / total).min(100);
                        if pct >= next_report {
                            log::info!("OTA progress: {}% ({}/{})", pct, written, total);
                            next_report = (pct / 10 + 1) * 10;
                        }
                    }
                    None => log::debug!("Written {} bytes, total {} bytes", read, written),
                }
            } else if stream.is_complete() {
                let written = session.bytes_written();
                log::info!("Download complete. Total size: {} bytes", written);
                if let Some(total) = declared {
                    if total != written {
                        log::warn!("Server declared {} bytes but sent {}", total, written);
                    }
                }
                return Ok(Download::Complete);
            } else {
                log::warn!(
                    "No data yet but stream is not complete, retrying in {:?}",
                    self.options.stall_retry
                );
                thread::sleep(self.options.stall_retry);
            }
        }
    }

    fn is_running_version(&self, head: &[u8]) -> bool {
        let Some(running) = self.options.running_version.as_deref() else {
            return false;
        };
        match AppDescriptor::parse(head) {
            Some(desc) => {
                log::info!("New firmware: {} {}, running: {}", desc.project, desc.version, running);
                if desc.version.as_str() == running {
                    log::warn!("Current running version is the same as the new one, skipping update");
                    return true;
                }
                false
            }
            None => {
                log::debug!("First chunk carries no app descriptor, skipping version check");
                false
            }
        }
    }

    fn fail(&self, err: UpdateError) -> UpdateError {
        self.status.set(err.phase());
        log::error!("OTA failed: {}", err);
        err
    }
}
