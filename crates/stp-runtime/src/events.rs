use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use stp_frame::Frame;
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::message::decode_payload;

/// Error a handler may return; it is logged and otherwise ignored.
pub type EventHandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked for every event of a subscribed service.
pub type EventHandler = Arc<dyn Fn(&Event) -> std::result::Result<(), EventHandlerError> + Send + Sync>;

/// An unsolicited notification from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub service: String,
    /// Event id within the service.
    pub command_id: u32,
    pub payload: Bytes,
}

impl Event {
    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.payload)
    }
}

impl From<Frame> for Event {
    fn from(frame: Frame) -> Self {
        Self {
            service: frame.service,
            command_id: frame.command_id,
            payload: frame.payload,
        }
    }
}

/// Routes events to at most one handler per service.
///
/// Handlers run on the dispatcher thread, never on the reactor, so a slow
/// handler delays other events but not responses.
pub struct EventDispatcher {
    handlers: Mutex<HashMap<String, EventHandler>>,
    budget: Duration,
}

impl EventDispatcher {
    pub fn new(budget: Duration) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            budget,
        }
    }

    /// Register `handler` for `service`, replacing any previous one.
    /// Returns true if a handler was replaced.
    pub fn subscribe<F>(&self, service: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Event) -> std::result::Result<(), EventHandlerError> + Send + Sync + 'static,
    {
        let service = service.into();
        debug!(service = %service, "event handler registered");
        self.handlers
            .lock()
            .insert(service, Arc::new(handler))
            .is_some()
    }

    /// Remove the handler for `service`. Returns true if one was registered.
    pub fn unsubscribe(&self, service: &str) -> bool {
        self.handlers.lock().remove(service).is_some()
    }

    pub fn is_subscribed(&self, service: &str) -> bool {
        self.handlers.lock().contains_key(service)
    }

    /// Invoke the handler for `event.service`, if any.
    ///
    /// Handler errors and panics are logged; they never propagate.
    pub fn dispatch(&self, event: &Event) {
        // Clone out of the lock so handlers may (un)subscribe.
        let handler = self.handlers.lock().get(&event.service).cloned();
        let Some(handler) = handler else {
            trace!(service = %event.service, id = event.command_id, "no handler for event");
            return;
        };

        let started = Instant::now();
        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(service = %event.service, id = event.command_id, error = %err, "event handler failed");
            }
            Err(panic) => {
                error!(
                    service = %event.service,
                    id = event.command_id,
                    panic = panic_message(&panic),
                    "event handler panicked"
                );
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.budget {
            warn!(
                service = %event.service,
                id = event.command_id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.budget.as_millis() as u64,
                "event handler exceeded its time budget"
            );
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<String> = self.handlers.lock().keys().cloned().collect();
        services.sort();
        f.debug_struct("EventDispatcher")
            .field("services", &services)
            .field("budget", &self.budget)
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic>"
    }
}

/// Reactor-side end of the event queue.
pub(crate) struct EventSink {
    tx: SyncSender<Event>,
}

impl EventSink {
    /// Queue an event without blocking. Drops it when the queue is full.
    pub(crate) fn deliver(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(service = %event.service, id = event.command_id, "event queue full; dropping event");
            }
            Err(TrySendError::Disconnected(event)) => {
                debug!(service = %event.service, "event thread gone; dropping event");
            }
        }
    }
}

/// Start the dispatcher thread. It exits once the sink is dropped and the
/// queue is drained.
pub(crate) fn spawn_dispatcher(
    dispatcher: Arc<EventDispatcher>,
    capacity: usize,
) -> std::io::Result<(EventSink, JoinHandle<()>)> {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let handle = thread::Builder::new()
        .name("stp-events".to_string())
        .spawn(move || run_dispatcher(&dispatcher, rx))?;
    Ok((EventSink { tx }, handle))
}

fn run_dispatcher(dispatcher: &EventDispatcher, rx: Receiver<Event>) {
    while let Ok(event) = rx.recv() {
        dispatcher.dispatch(&event);
    }
    trace!("event dispatcher stopped");
}
