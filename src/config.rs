//! Session configuration (§3.1's `SessionConfig`): built once, handed to
//! `Session::new`.

use std::path::PathBuf;

/// Default ACK window, used until the server announces its own via a
/// main-channel message (§6).
pub const DEFAULT_ACK_WINDOW: u32 = 30;

/// Default size of a single non-blocking read chunk (component D / E).
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Default number of times a plain-socket connect attempt is retried
/// (promoted to TLS, per §4.5) before giving up.
pub const DEFAULT_CONNECT_RETRIES: usize = 1;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub tls_port: Option<u16>,
    pub password: String,
    pub ca_file: Option<PathBuf>,
    pub ack_window: u32,
    pub connect_retries: usize,
    pub read_chunk: usize,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        SessionConfig {
            host: host.into(),
            port,
            tls_port: None,
            password: String::new(),
            ca_file: None,
            ack_window: DEFAULT_ACK_WINDOW,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    pub fn tls_port(mut self, port: u16) -> Self {
        self.tls_port = Some(port);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn ack_window(mut self, window: u32) -> Self {
        self.ack_window = window;
        self
    }

    pub fn connect_retries(mut self, retries: usize) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = size;
        self
    }
}
