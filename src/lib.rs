//! Client for card readers that speak a newline-delimited ASCII protocol.
//!
//! The reader reports `STAT:<status>` and `IDM:<card id>` lines. A background
//! thread reads them and republishes each as a raw line plus, where it
//! applies, a status or card identifier event.
//!
//! # Features
//!
//! - `serial` - Serial port transport for desktop using serialport crate
//!
//! # Example
//!
//! ```ignore
//! use card_reader_line::{CardReader, SerialConnector};
//!
//! let mut reader = CardReader::new(SerialConnector);
//! reader.on_card_id(|id| println!("Card: {id}"));
//! reader.on_status(|status| println!("Status: {status}"));
//! reader.open_default("/dev/ttyACM0")?;
//!
//! reader.send("LED ON");
//! ```

mod dispatch;
mod reader;
mod transport;
mod types;

#[cfg(feature = "serial")]
mod serial;

// Re-exports
pub use reader::{classify_line, CardReader};
pub use transport::{Connector, LineTransport, PortSettings};
pub use types::{ReaderConfig, ReaderError, ReaderEvent};

#[cfg(feature = "serial")]
pub use serial::{SerialConnector, SerialTransport};
