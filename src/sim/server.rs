// Scripted firmware server: serves a fixed body with optional stalls,
// redirects and injected failures, and records what the client did

use parking_lot::Mutex;
use std::sync::Arc;

use crate::ota::error::TransportError;
use crate::ota::transport::{strip_for_redirect, ByteStream, Transport};

const USER_AGENT: &str = "esp32-sensor-node";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Default)]
struct ServerLog {
    requests: Vec<RecordedRequest>,
    opens: usize,
    closes: usize,
    stalls: usize,
}

#[derive(Debug, Clone)]
pub struct ScriptedServer {
    body: Arc<[u8]>,
    declare_length: bool,
    status: u16,
    refuse: bool,
    redirect_to: Option<String>,
    stall_every: Option<usize>,
    fail_read_after: Option<u64>,
    log: Arc<Mutex<ServerLog>>,
}

impl ScriptedServer {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: body.into(),
            declare_length: true,
            status: 200,
            refuse: false,
            redirect_to: None,
            stall_every: None,
            fail_read_after: None,
            log: Arc::new(Mutex::new(ServerLog::default())),
        }
    }

    /// No Content-Length header
    pub fn without_length(mut self) -> Self {
        self.declare_length = false;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn refuse_connections(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn redirect_to(mut self, url: impl Into<String>) -> Self {
        self.redirect_to = Some(url.into());
        self
    }

    /// Return an empty, not-yet-complete read after every `reads` data reads
    pub fn stall_every(mut self, reads: usize) -> Self {
        self.stall_every = Some(reads.max(1));
        self
    }

    /// Reset the connection once `bytes` have been delivered
    pub fn fail_read_after(mut self, bytes: u64) -> Self {
        self.fail_read_after = Some(bytes);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().requests.clone()
    }

    pub fn opens(&self) -> usize {
        self.log.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.log.lock().closes
    }

    pub fn stalls(&self) -> usize {
        self.log.lock().stalls
    }

    fn record(&self, url: &str, headers: Vec<(String, String)>) {
        self.log.lock().requests.push(RecordedRequest {
            url: url.to_string(),
            headers,
        });
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

fn request_headers(url: &str) -> Vec<(String, String)> {
    vec![
        ("Host".to_string(), host_of(url).to_string()),
        ("User-Agent".to_string(), USER_AGENT.to_string()),
    ]
}

impl Transport for ScriptedServer {
    type Stream = ScriptedStream;

    fn open(&mut self, url: &str) -> Result<ScriptedStream, TransportError> {
        let mut headers = request_headers(url);
        self.record(url, headers.clone());

        if self.refuse {
            return Err(TransportError::Connect(format!("{}: connection refused", host_of(url))));
        }

        if let Some(target) = self.redirect_to.as_deref().filter(|target| *target != url) {
            log::debug!("Following redirect {} -> {}", url, target);
            strip_for_redirect(&mut headers);
            headers.push(("Host".to_string(), host_of(target).to_string()));
            self.record(target, headers);
        }

        if !(200..300).contains(&self.status) {
            return Err(TransportError::Status(self.status));
        }

        self.log.lock().opens += 1;
        Ok(ScriptedStream {
            body: Arc::clone(&self.body),
            position: 0,
            declared: self.declare_length.then(|| self.body.len() as u64),
            stall_every: self.stall_every,
            reads_since_stall: 0,
            fail_read_after: self.fail_read_after,
            complete: false,
            closed: false,
            log: Arc::clone(&self.log),
        })
    }
}

pub struct ScriptedStream {
    body: Arc<[u8]>,
    position: usize,
    declared: Option<u64>,
    stall_every: Option<usize>,
    reads_since_stall: usize,
    fail_read_after: Option<u64>,
    complete: bool,
    closed: bool,
    log: Arc<Mutex<ServerLog>>,
}

impl ByteStream for ScriptedStream {
    fn declared_length(&self) -> Option<u64> {
        self.declared
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Read("stream closed".into()));
        }

        // A fully delivered body completes even if a reset was scheduled later
        if self.position >= self.body.len() {
            self.complete = true;
            return Ok(0);
        }

        let mut end = self.body.len();
        if let Some(limit) = self.fail_read_after {
            if self.position as u64 >= limit {
                return Err(TransportError::Read("connection reset by peer".into()));
            }
            end = end.min(limit as usize);
        }

        if self.stall_every == Some(self.reads_since_stall) {
            self.reads_since_stall = 0;
            self.log.lock().stalls += 1;
            return Ok(0);
        }

        let n = buf.len().min(end - self.position);
        buf[..n].copy_from_slice(&self.body[self.position..self.position + n]);
        self.position += n;
        self.reads_since_stall += 1;
        Ok(n)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().closes += 1;
        }
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(stream: &mut ScriptedStream, chunk: usize) -> Result<(Vec<u8>, usize), TransportError> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        let mut empty_reads = 0;
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                if stream.is_complete() {
                    return Ok((out, empty_reads));
                }
                empty_reads += 1;
                continue;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn serves_body_with_stalls() {
        let mut server = ScriptedServer::new((0..=255u8).cycle().take(5000).collect()).stall_every(2);
        let mut stream = server.open("http://fw.local/app.bin").unwrap();
        assert_eq!(stream.declared_length(), Some(5000));

        let (body, empty_reads) = drain(&mut stream, 1000).unwrap();
        assert_eq!(body.len(), 5000);
        assert_eq!(body[257], 1);
        assert_eq!(empty_reads, server.stalls());
        assert!(empty_reads >= 2);
    }

    #[test]
    fn close_is_idempotent_and_counted_once() {
        let mut server = ScriptedServer::new(vec![1, 2, 3]);
        let mut stream = server.open("http://fw.local/app.bin").unwrap();
        stream.close();
        stream.close();
        drop(stream);
        assert_eq!(server.closes(), 1);
    }

    #[test]
    fn redirect_does_not_leak_the_original_host() {
        let mut server = ScriptedServer::new(vec![0; 10]).redirect_to("http://cdn.example.net/fw/app.bin");
        server.open("http://fw.local/app.bin").unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].header("host"), Some("fw.local"));
        assert_eq!(requests[1].url, "http://cdn.example.net/fw/app.bin");
        assert_eq!(requests[1].header("Host"), Some("cdn.example.net"));
        assert_eq!(requests[1].headers.iter().filter(|(k, _)| k == "Host").count(), 1);
    }

    #[test]
    fn read_failure_after_limit() {
        let mut server = ScriptedServer::new(vec![9; 4096]).fail_read_after(1500);
        let mut stream = server.open("http://fw.local/app.bin").unwrap();
        let err = drain(&mut stream, 1024).unwrap_err();
        assert!(matches!(err, TransportError::Read(_)));
    }

    #[test]
    fn reset_scheduled_past_the_body_never_fires() {
        for limit in [4096, 10_000] {
            let mut server = ScriptedServer::new(vec![9; 4096]).fail_read_after(limit);
            let mut stream = server.open("http://fw.local/app.bin").unwrap();
            let (body, _) = drain(&mut stream, 1024).unwrap();
            assert_eq!(body.len(), 4096);
            assert!(stream.is_complete());
        }
    }

    #[test]
    fn error_statuses_and_refusals() {
        let mut missing = ScriptedServer::new(vec![]).with_status(404);
        assert!(matches!(missing.open("http://fw.local/x").err(), Some(TransportError::Status(404))));
        let mut down = ScriptedServer::new(vec![]).refuse_connections();
        assert!(matches!(down.open("http://fw.local/x").err(), Some(TransportError::Connect(_))));
        assert_eq!(down.opens(), 0);
    }
}
