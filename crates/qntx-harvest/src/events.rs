//! Acquisition events and callback dispatch
//!
//! Callbacks run on a dedicated thread fed by a channel, so the delivery
//! thread and teardown never wait on consumer code.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A buffer entered the hold list
    NewBufferAvailable { frame_id: u64 },
    /// The producer delivered a partial buffer; it was requeued
    IncompleteBuffer { frame_id: u64 },
    /// A frame-count-bounded session received its last frame
    ReadyToStop,
    /// Stop found buffers still lent to consumers
    ReturnAllBorrowedBuffers { count: usize },
    /// start() on a running, paused engine
    Resumed,
    /// The engine is being dropped
    TurnedObsolete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewBufferAvailable,
    IncompleteBuffer,
    ReadyToStop,
    ReturnAllBorrowedBuffers,
    Resumed,
    TurnedObsolete,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NewBufferAvailable { .. } => EventKind::NewBufferAvailable,
            Event::IncompleteBuffer { .. } => EventKind::IncompleteBuffer,
            Event::ReadyToStop => EventKind::ReadyToStop,
            Event::ReturnAllBorrowedBuffers { .. } => EventKind::ReturnAllBorrowedBuffers,
            Event::Resumed => EventKind::Resumed,
            Event::TurnedObsolete => EventKind::TurnedObsolete,
        }
    }
}

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

type Registry = Arc<RwLock<HashMap<EventKind, Vec<Callback>>>>;

enum Dispatch {
    Event(Event),
    /// Run the halt handler (cancellation observed by the delivery thread)
    Halt,
    Close,
}

/// Cheap handle for posting to the dispatcher
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: Sender<Dispatch>,
}

impl EventSender {
    pub fn emit(&self, event: Event) {
        // Dispatcher gone means the engine is shutting down
        let _ = self.tx.send(Dispatch::Event(event));
    }

    pub fn halt(&self) {
        let _ = self.tx.send(Dispatch::Halt);
    }
}

pub(crate) struct EventDispatcher {
    tx: Sender<Dispatch>,
    registry: Registry,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn spawn<F>(name: String, on_halt: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = unbounded::<Dispatch>();
        let registry: Registry = Arc::default();
        let callbacks = Arc::clone(&registry);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for message in rx.iter() {
                    match message {
                        Dispatch::Event(event) => {
                            let targets = callbacks
                                .read()
                                .get(&event.kind())
                                .cloned()
                                .unwrap_or_default();
                            for callback in targets {
                                if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                                    warn!(kind = ?event.kind(), "event callback panicked");
                                }
                            }
                        }
                        Dispatch::Halt => on_halt(),
                        Dispatch::Close => break,
                    }
                }
                debug!("event dispatcher exited");
            })
            .map_err(|e| HarvestError::Worker(format!("failed to spawn {}: {}", name, e)))?;

        Ok(Self {
            tx,
            registry,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn add(&self, kind: EventKind, callback: Callback) {
        self.registry.write().entry(kind).or_default().push(callback);
    }

    pub fn remove_all(&self, kind: EventKind) {
        self.registry.write().remove(&kind);
    }

    /// Deliver what is queued, then stop the thread.
    pub fn close(&self) {
        let _ = self.tx.send(Dispatch::Close);
        if let Some(handle) = self.handle.lock().take() {
            // Closing from a callback must not join itself
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("event dispatcher panicked");
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}
