use std::time::Duration;

/// Settings applied when a transport is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Assert DTR after opening
    pub dtr: bool,
    /// Assert RTS after opening
    pub rts: bool,
}

/// Trait for line-oriented reader communication backends.
///
/// All methods take `&self`: the background reader and the caller's write
/// path use the same handle concurrently, so implementations synchronize
/// internally.
pub trait LineTransport: Send + Sync + 'static {
    /// Error type for transport operations
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read one line, blocking up to the configured read timeout.
    /// The returned text may still carry its CR/LF terminator.
    fn read_line(&self) -> Result<String, Self::Error>;

    /// Write text as-is
    fn write(&self, data: &str) -> Result<(), Self::Error>;

    /// Whether the underlying channel is still open
    fn is_open(&self) -> bool;

    /// Close the channel. Reads and writes fail afterwards.
    fn close(&self) -> Result<(), Self::Error>;
}

/// Opens transports by port name.
pub trait Connector: Send + Sync {
    type Transport: LineTransport;

    fn connect(
        &self,
        port_name: &str,
        settings: &PortSettings,
    ) -> Result<Self::Transport, <Self::Transport as LineTransport>::Error>;
}
