//! Fan-out of reader events to registered subscribers

use log::warn;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::ReaderEvent;

/// A subscriber callback panicked while handling an event
#[derive(Debug, thiserror::Error)]
#[error("subscriber panicked: {0}")]
pub(crate) struct CallbackPanic(String);

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

pub(crate) type Callback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

#[derive(Default)]
struct Lists {
    raw: Vec<Callback>,
    status: Vec<Callback>,
    card_id: Vec<Callback>,
    channels: Vec<Sender<ReaderEvent>>,
}

/// Subscriber lists shared between the client and its reader thread
#[derive(Default)]
pub(crate) struct Subscribers {
    lists: Mutex<Lists>,
}

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add_raw(&self, f: Callback) {
        self.lock().raw.push(f);
    }

    pub(crate) fn add_status(&self, f: Callback) {
        self.lock().status.push(f);
    }

    pub(crate) fn add_card_id(&self, f: Callback) {
        self.lock().card_id.push(f);
    }

    pub(crate) fn channel(&self) -> Receiver<ReaderEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().channels.push(tx);
        rx
    }

    /// Deliver one event to every subscriber of its kind, then to every channel.
    ///
    /// Callbacks are invoked without holding the lock, so they may register
    /// further subscribers. A panicking callback does not stop delivery to the
    /// others; the first panic is returned once the event has been delivered.
    pub(crate) fn dispatch(&self, event: &ReaderEvent) -> Result<(), CallbackPanic> {
        let callbacks = {
            let lists = self.lock();
            match event {
                ReaderEvent::Raw(_) => lists.raw.clone(),
                ReaderEvent::Status(_) => lists.status.clone(),
                ReaderEvent::CardId(_) => lists.card_id.clone(),
            }
        };

        let mut first_panic = None;
        for callback in &callbacks {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| callback(event.payload())));
            if let Err(payload) = delivered {
                let message = panic_message(&*payload);
                warn!("Subscriber panicked on {:?}: {}", event, message);
                first_panic.get_or_insert(CallbackPanic(message));
            }
        }

        // Receivers that were dropped are pruned here
        self.lock()
            .channels
            .retain(|tx| tx.send(event.clone()).is_ok());

        first_panic.map_or(Ok(()), Err)
    }
}
