//! Types for card reader operations

use std::time::Duration;

/// A notification derived from one line received from the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// Every non-empty line, CR/LF stripped. Read errors arrive here as `RXERR:<message>`.
    Raw(String),
    /// Payload of a `STAT:` line
    Status(String),
    /// Uppercased payload of an `IDM:` line
    CardId(String),
}

impl ReaderEvent {
    /// The string payload carried by the event
    pub fn payload(&self) -> &str {
        match self {
            ReaderEvent::Raw(s) | ReaderEvent::Status(s) | ReaderEvent::CardId(s) => s,
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during card reader operations
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// The transport could not be opened
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: BoxError,
    },

    /// The background reader thread could not be started
    #[error("failed to start reader thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reopen requested but no port was ever opened
    #[error("no port to reopen")]
    NoPort,

    /// Writing a command to the transport failed
    #[error("write failed: {0}")]
    Write(#[source] BoxError),

    /// The transport has been closed
    #[error("transport closed")]
    Closed,
}

impl ReaderError {
    pub(crate) fn open(port: &str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Open {
            port: port.to_owned(),
            source: Box::new(source),
        }
    }

    pub(crate) fn write(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Write(Box::new(source))
    }
}

/// Timing and connection defaults for a [`crate::CardReader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Baud rate used by `open_default` and implicit reopens
    pub baud_rate: u32,
    /// Pause after the port opens so the device can finish booting
    pub warmup: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Pause after a read error before the next read attempt
    pub error_pause: Duration,
    /// How long `close` waits for the reader thread
    pub join_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            warmup: Duration::from_millis(1500),
            read_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
            error_pause: Duration::from_millis(200),
            join_timeout: Duration::from_millis(300),
        }
    }
}

impl ReaderConfig {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Ignored by the serial backend on Windows, where the read and write
    /// handles share one device timeout and `read_timeout` applies to both.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

/// Decode bytes as ASCII, replacing anything outside 7-bit range with `?`
#[cfg_attr(not(feature = "serial"), allow(dead_code))]
pub(crate) fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

/// Encode text as ASCII, replacing non-ASCII characters with `?`
#[cfg_attr(not(feature = "serial"), allow(dead_code))]
pub(crate) fn encode_ascii(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}
