use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::dispatch::Subscribers;
use crate::transport::{Connector, LineTransport, PortSettings};
use crate::types::{ReaderConfig, ReaderError, ReaderEvent};

// Protocol constants
const STATUS_PREFIX: &str = "STAT:";
const CARD_ID_PREFIX: &str = "IDM:";
const READ_ERROR_PREFIX: &str = "RXERR:";

const RX_THREAD_NAME: &str = "card-reader-rx";

/// Classify one received line into the events it produces.
///
/// Trailing CR/LF is stripped first. An empty line yields nothing; any other
/// line yields [`ReaderEvent::Raw`] followed by at most one derived event.
pub fn classify_line(line: &str) -> Vec<ReaderEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Vec::new();
    }

    let mut events = vec![ReaderEvent::Raw(line.to_owned())];

    if let Some(rest) = strip_prefix_ignore_case(line, STATUS_PREFIX) {
        let status = rest.trim();
        if !status.is_empty() {
            events.push(ReaderEvent::Status(status.to_owned()));
        }
    } else if let Some(rest) = strip_prefix_ignore_case(line, CARD_ID_PREFIX) {
        let id = rest.trim().to_uppercase();
        if !id.is_empty() {
            events.push(ReaderEvent::CardId(id));
        }
    }

    events
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &line[prefix.len()..])
}

/// Live connection: the transport and the reader thread bound to it
struct Connection<T> {
    transport: Arc<T>,
    stop: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
    /// Disconnects when the reader thread exits
    finished: Receiver<()>,
}

/// Client for a card reader that reports `STAT:` and `IDM:` lines over a serial link.
///
/// Events are read on a background thread and delivered to subscribers
/// registered with [`on_raw_line`](Self::on_raw_line),
/// [`on_status`](Self::on_status), [`on_card_id`](Self::on_card_id) or
/// [`subscribe`](Self::subscribe).
pub struct CardReader<C: Connector> {
    connector: C,
    config: ReaderConfig,
    subscribers: Arc<Subscribers>,
    connection: Option<Connection<C::Transport>>,
    port_name: Option<String>,
    baud_rate: u32,
}

impl<C: Connector> CardReader<C> {
    /// Create a closed client with the default timings
    pub fn new(connector: C) -> Self {
        Self::with_config(connector, ReaderConfig::default())
    }

    pub fn with_config(connector: C, config: ReaderConfig) -> Self {
        Self {
            connector,
            baud_rate: config.baud_rate,
            config,
            subscribers: Arc::new(Subscribers::default()),
            connection: None,
            port_name: None,
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Port name of the current or last connection
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Baud rate of the current or last connection
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// True if a transport exists and reports itself open
    pub fn is_open(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.transport.is_open())
    }

    /// Open the port and start the background reader.
    ///
    /// Does nothing if already open. After the transport opens, blocks for
    /// `warmup` so the device can finish booting before any traffic.
    ///
    /// # Errors
    /// [`ReaderError::Open`] if the transport cannot be opened, or
    /// [`ReaderError::Spawn`] if the reader thread cannot be started. No
    /// connection is kept in either case.
    pub fn open(
        &mut self,
        port_name: &str,
        baud_rate: u32,
        warmup: Duration,
    ) -> Result<(), ReaderError> {
        if self.is_open() {
            return Ok(());
        }
        // The transport dropped out underneath us; clear it before reconnecting
        if self.connection.is_some() {
            self.close();
        }

        self.port_name = Some(port_name.to_owned());

        let settings = PortSettings {
            baud_rate,
            read_timeout: self.config.read_timeout,
            write_timeout: self.config.write_timeout,
            dtr: true,
            rts: true,
        };
        let transport = self
            .connector
            .connect(port_name, &settings)
            .map_err(|e| ReaderError::open(port_name, e))?;
        debug!("Opened {} at {} baud", port_name, baud_rate);

        thread::sleep(warmup);

        let transport = Arc::new(transport);
        let stop = Arc::new(AtomicBool::new(false));
        let (finished_tx, finished) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name(RX_THREAD_NAME.into())
            .spawn({
                let transport = transport.clone();
                let stop = stop.clone();
                let subscribers = self.subscribers.clone();
                let error_pause = self.config.error_pause;
                move || {
                    let _finished = finished_tx;
                    rx_loop(&*transport, &stop, &subscribers, error_pause);
                }
            });

        let rx_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start reader thread: {}", e);
                if let Err(e) = transport.close() {
                    warn!("Failed to close transport: {}", e);
                }
                return Err(ReaderError::Spawn(e));
            }
        };

        self.baud_rate = baud_rate;
        self.connection = Some(Connection {
            transport,
            stop,
            rx_thread: Some(rx_thread),
            finished,
        });
        Ok(())
    }

    /// [`open`](Self::open) with the configured baud rate and warm-up
    pub fn open_default(&mut self, port_name: &str) -> Result<(), ReaderError> {
        let (baud_rate, warmup) = (self.config.baud_rate, self.config.warmup);
        self.open(port_name, baud_rate, warmup)
    }

    /// Send one command line, reopening the last port first if needed.
    ///
    /// Never fails: errors are logged and dropped so a flaky device cannot
    /// stall the caller. Use [`try_send`](Self::try_send) to observe them.
    pub fn send(&mut self, line: &str) {
        if let Err(e) = self.try_send(line) {
            warn!("Send failed: {}", e);
        }
    }

    /// Like [`send`](Self::send), but reports failures.
    ///
    /// The line is trimmed and terminated with a single `\n`.
    ///
    /// # Errors
    /// [`ReaderError::NoPort`] if closed and no port was ever opened,
    /// [`ReaderError::Open`] if the reopen fails, [`ReaderError::Write`] if
    /// the write fails.
    pub fn try_send(&mut self, line: &str) -> Result<(), ReaderError> {
        if !self.is_open() {
            let port_name = self.port_name.clone().ok_or(ReaderError::NoPort)?;
            debug!("Reopening {} to send", port_name);
            self.open_default(&port_name)?;
        }

        let connection = self.connection.as_ref().ok_or(ReaderError::Closed)?;
        let command = format!("{}\n", line.trim());
        debug!("Sending command: {:?}", command);
        connection
            .transport
            .write(&command)
            .map_err(ReaderError::write)
    }

    /// Stop the reader thread and close the transport.
    ///
    /// Safe to call at any time. Waits at most the configured join timeout
    /// for the reader; a reader still blocked after that is detached. Every
    /// teardown step runs even if an earlier one fails.
    pub fn close(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        connection.stop.store(true, Ordering::Release);

        if let Some(handle) = connection.rx_thread.take() {
            match connection.finished.recv_timeout(self.config.join_timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Reader thread still running after {:?}, detaching",
                        self.config.join_timeout
                    );
                }
                _ => {
                    if handle.join().is_err() {
                        warn!("Reader thread panicked");
                    }
                }
            }
        }

        if let Err(e) = connection.transport.close() {
            warn!("Failed to close transport: {}", e);
        }
        debug!("Closed {}", self.port_name.as_deref().unwrap_or("<unknown>"));
    }

    /// Register a callback for every non-empty line, including `RXERR:` markers
    pub fn on_raw_line<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers.add_raw(Arc::new(f));
    }

    /// Register a callback for `STAT:` payloads
    pub fn on_status<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers.add_status(Arc::new(f));
    }

    /// Register a callback for uppercased `IDM:` payloads
    pub fn on_card_id<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers.add_card_id(Arc::new(f));
    }

    /// Receive every event, in read order, as a [`ReaderEvent`]
    pub fn subscribe(&self) -> Receiver<ReaderEvent> {
        self.subscribers.channel()
    }
}

impl<C: Connector> Drop for CardReader<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn rx_loop<T: LineTransport>(
    transport: &T,
    stop: &AtomicBool,
    subscribers: &Subscribers,
    error_pause: Duration,
) {
    while !stop.load(Ordering::Acquire) {
        if !transport.is_open() {
            break;
        }

        // Processing a line stops at the first subscriber panic, like a read error
        let processed = transport.read_line().map_err(|e| e.to_string()).and_then(|line| {
            classify_line(&line)
                .iter()
                .try_for_each(|event| subscribers.dispatch(event))
                .map_err(|e| e.to_string())
        });

        if let Err(message) = processed {
            debug!("Reader error: {}", message);
            report_error(subscribers, &message);
            thread::sleep(error_pause);
        }
    }
    debug!("Reader thread exiting");
}

fn report_error(subscribers: &Subscribers, message: &str) {
    let event = ReaderEvent::Raw(format!("{READ_ERROR_PREFIX}{message}"));
    // A subscriber that panics on the error report itself is already logged
    let _ = subscribers.dispatch(&event);
}
