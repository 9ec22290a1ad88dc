// Streaming transport - where firmware bytes come from

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::time::Duration;

use super::error::TransportError;

/// Request headers that identify the original host. They must not follow a
/// redirect to a different host.
pub const HOST_IDENTIFYING_HEADERS: &[&str] = &["Host"];

/// Connection settings every transport backend must honour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub keep_alive: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(15_000),
            keep_alive: true,
        }
    }
}

/// Opens byte streams for a URL. Redirects are followed by the backend.
pub trait Transport {
    type Stream: ByteStream;

    fn open(&mut self, url: &str) -> Result<Self::Stream, TransportError>;
}

/// An open download. Backends also close on drop.
pub trait ByteStream {
    /// Content length if the server advertised one
    fn declared_length(&self) -> Option<u64>;

    /// `Ok(0)` means "nothing right now"; check [`ByteStream::is_complete`]
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn is_complete(&self) -> bool;

    /// Release the connection. Calling it again is a no-op.
    fn close(&mut self);
}

/// Drop host-identifying headers before a redirected request is resubmitted
pub fn strip_for_redirect(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| {
        !HOST_IDENTIFYING_HEADERS
            .iter()
            .any(|host| name.eq_ignore_ascii_case(host))
    });
}

/// Serves images from the local filesystem (`file://` URLs or plain paths)
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTransport;

impl Transport for FileTransport {
    type Stream = FileStream;

    fn open(&mut self, url: &str) -> Result<FileStream, TransportError> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let file = File::open(path).map_err(|e| TransportError::Connect(format!("{}: {}", path, e)))?;
        let length = file.metadata().ok().map(|meta| meta.len());
        log::info!("Opened {} ({:?} bytes)", path, length);
        Ok(FileStream {
            file: Some(file),
            length,
            complete: false,
        })
    }
}

pub struct FileStream {
    file: Option<File>,
    length: Option<u64>,
    complete: bool,
}

impl ByteStream for FileStream {
    fn declared_length(&self) -> Option<u64> {
        self.length
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let Some(file) = self.file.as_mut() else {
            return Err(TransportError::Read("stream closed".into()));
        };
        loop {
            match file.read(buf) {
                Ok(0) if !buf.is_empty() => {
                    self.complete = true;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Read(e.to_string())),
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn close(&mut self) {
        self.file = None;
    }
}
