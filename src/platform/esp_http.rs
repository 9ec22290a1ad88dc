// ESP-IDF HTTP client transport

use core::ffi::c_char;
use std::ffi::CString;

use esp_idf_sys::{
    esp_http_client_cleanup, esp_http_client_close, esp_http_client_config_t,
    esp_http_client_delete_header, esp_http_client_fetch_headers, esp_http_client_flush_response,
    esp_http_client_get_errno, esp_http_client_get_status_code, esp_http_client_handle_t,
    esp_http_client_init, esp_http_client_is_complete_data_received, esp_http_client_open,
    esp_http_client_read, esp_http_client_set_redirection, ESP_OK,
};

use crate::ota::error::TransportError;
use crate::ota::transport::{ByteStream, Transport, TransportConfig, HOST_IDENTIFYING_HEADERS};

const MAX_REDIRECTS: usize = 5;

fn is_redirect(status: i32) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

pub struct EspHttpTransport {
    config: TransportConfig,
}

impl EspHttpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Transport for EspHttpTransport {
    type Stream = EspHttpStream;

    fn open(&mut self, url: &str) -> Result<EspHttpStream, TransportError> {
        let url_c = CString::new(url).map_err(|_| TransportError::Connect("URL contains NUL".into()))?;

        let config = esp_http_client_config_t {
            url: url_c.as_ptr(),
            timeout_ms: self.config.timeout.as_millis().min(i32::MAX as u128) as i32,
            keep_alive_enable: self.config.keep_alive,
            ..Default::default()
        };

        let client = unsafe { esp_http_client_init(&config) };
        if client.is_null() {
            return Err(TransportError::Connect("failed to initialise HTTP connection".into()));
        }
        // From here on the stream owns the client and releases it on drop
        let mut stream = EspHttpStream {
            client,
            declared: None,
            closed: false,
        };

        let mut redirects = 0;
        loop {
            let err = unsafe { esp_http_client_open(client, 0) };
            if err != ESP_OK as i32 {
                return Err(TransportError::Connect(format!("failed to open HTTP connection (err {})", err)));
            }

            let content_length = unsafe { esp_http_client_fetch_headers(client) };
            let status = unsafe { esp_http_client_get_status_code(client) };

            if is_redirect(status) && redirects < MAX_REDIRECTS {
                redirects += 1;
                log::info!("HTTP redirect {} ({} of {})", status, redirects, MAX_REDIRECTS);
                unsafe {
                    esp_http_client_flush_response(client, core::ptr::null_mut());
                    esp_http_client_close(client);
                    esp_http_client_set_redirection(client);
                    // The original Host must not follow us to the new location
                    for name in HOST_IDENTIFYING_HEADERS {
                        if let Ok(name) = CString::new(*name) {
                            esp_http_client_delete_header(client, name.as_ptr());
                        }
                    }
                }
                continue;
            }

            if !(200..300).contains(&status) {
                return Err(TransportError::Status(status.clamp(0, u16::MAX as i32) as u16));
            }

            stream.declared = u64::try_from(content_length).ok().filter(|len| *len > 0);
            log::info!("HTTP {} from {}, content length {:?}", status, url, stream.declared);
            return Ok(stream);
        }
    }
}

pub struct EspHttpStream {
    client: esp_http_client_handle_t,
    declared: Option<u64>,
    closed: bool,
}

// SAFETY: the client handle is only touched through &mut self or on drop,
// so it is never used from two threads at once
unsafe impl Send for EspHttpStream {}

impl ByteStream for EspHttpStream {
    fn declared_length(&self) -> Option<u64> {
        self.declared
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Read("stream closed".into()));
        }
        let len = buf.len().min(i32::MAX as usize) as i32;
        let n = unsafe { esp_http_client_read(self.client, buf.as_mut_ptr() as *mut c_char, len) };
        if n < 0 {
            let errno = unsafe { esp_http_client_get_errno(self.client) };
            return Err(TransportError::Read(format!("esp_http_client_read failed (errno {})", errno)));
        }
        Ok(n as usize)
    }

    fn is_complete(&self) -> bool {
        !self.closed && unsafe { esp_http_client_is_complete_data_received(self.client) }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            unsafe {
                esp_http_client_close(self.client);
                esp_http_client_cleanup(self.client);
            }
        }
    }
}

impl Drop for EspHttpStream {
    fn drop(&mut self) {
        self.close();
    }
}
