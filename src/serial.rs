//! Serial port transport for desktop using serialport crate

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

use crate::transport::{Connector, LineTransport, PortSettings};
use crate::types::{decode_ascii, encode_ascii, ReaderError};

/// Longest run of bytes without a newline before it is handed out as a line anyway
const MAX_LINE_LEN: usize = 4096;

/// Opens [`SerialTransport`]s by OS port name (`COM3`, `/dev/ttyACM0`, ...)
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Transport = SerialTransport;

    fn connect(&self, port_name: &str, settings: &PortSettings) -> io::Result<SerialTransport> {
        SerialTransport::open(port_name, settings)
    }
}

/// Buffers bytes across read timeouts until a full line is available
struct LineReader<R> {
    port: R,
    pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    fn new(port: R) -> Self {
        Self {
            port,
            pending: Vec::new(),
        }
    }

    /// Returns the next line including its `\n`. A timeout keeps any partial
    /// line buffered for the next call.
    fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(decode_ascii(&line));
            }
            if self.pending.len() >= MAX_LINE_LEN {
                let line = std::mem::take(&mut self.pending);
                return Ok(decode_ascii(&line));
            }

            let mut buf = [0u8; 256];
            let n = self.port.read(&mut buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "port returned no data"));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }
}

/// Serial link to the reader.
///
/// Holds two handles to the same port so that writes are not blocked by a
/// read waiting out its timeout.
pub struct SerialTransport {
    reader: Mutex<Option<LineReader<Box<dyn SerialPort>>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    closed: AtomicBool,
}

impl SerialTransport {
    pub fn open(port_name: &str, settings: &PortSettings) -> io::Result<Self> {
        let mut port = serialport::new(port_name, settings.baud_rate)
            .timeout(settings.read_timeout)
            .open()?;
        port.write_data_terminal_ready(settings.dtr)?;
        port.write_request_to_send(settings.rts)?;
        port.clear(ClearBuffer::Input)?;

        let mut writer = port.try_clone()?;
        writer.set_timeout(write_timeout(settings))?;

        Ok(Self {
            reader: Mutex::new(Some(LineReader::new(port))),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        })
    }
}

/// Timeout for the write handle.
///
/// On Windows the cloned handle shares the device's COMMTIMEOUTS with the
/// read handle, so a separate write timeout would replace the read timeout.
fn write_timeout(settings: &PortSettings) -> Duration {
    if cfg!(windows) {
        settings.read_timeout
    } else {
        settings.write_timeout
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, ReaderError::Closed)
}

impl LineTransport for SerialTransport {
    type Error = io::Error;

    fn read_line(&self) -> io::Result<String> {
        let mut reader = lock(&self.reader);
        if self.closed.load(Ordering::Acquire) {
            // close() could not take the reader while we held it
            reader.take();
            return Err(closed_error());
        }
        reader.as_mut().ok_or_else(closed_error)?.read_line()
    }

    fn write(&self, data: &str) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        let port = writer.as_mut().ok_or_else(closed_error)?;
        port.write_all(&encode_ascii(data))?;
        port.flush()
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        lock(&self.writer).take();
        // A reader blocked in read_line drops its handle when the read returns
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        Ok(())
    }
}
