//! Asynchronous device events.
//!
//! Events are queued on a bounded channel and delivered one at a time by a
//! single dispatcher task, in the order they were generated. While the
//! registered handler runs, the dispatcher holds the write side of the
//! originating device's gate, so control calls for that device from other
//! threads wait until the handler returns. Calls made from inside the
//! handler skip the gate; see [`in_dispatch`].
//!
//! Handlers are plain synchronous closures. They run on Tokio's blocking
//! pool and may call back into the async API with
//! `tokio::runtime::Handle::current().block_on(..)`.
//!
//! # Event Codes
//!
//! | Event            | Code |
//! |------------------|------|
//! | ButtonPressed    | 0x01 |
//! | ScanReadyToMove  | 0x02 |
//! | LampRestore      | 0x03 |
//! | Arrival          | 0x11 |
//! | Departure        | 0x12 |

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::session::DeviceHandle;

/// Kind of device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    /// A device was attached.
    Arrival,
    /// A device was detached; its handle is invalid.
    Departure,
    /// The measure button was pressed.
    ButtonPressed,
    /// The scan light is on; the operator may start moving.
    ScanReadyToMove,
    /// A lamp restore starts; calibration takes longer than usual.
    LampRestore,
}

impl DeviceEventKind {
    /// Numeric event code.
    pub fn code(&self) -> u32 {
        match self {
            Self::ButtonPressed => 0x01,
            Self::ScanReadyToMove => 0x02,
            Self::LampRestore => 0x03,
            Self::Arrival => 0x11,
            Self::Departure => 0x12,
        }
    }
}

impl fmt::Display for DeviceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Arrival => "arrival",
            Self::Departure => "departure",
            Self::ButtonPressed => "button-pressed",
            Self::ScanReadyToMove => "scan-ready-to-move",
            Self::LampRestore => "lamp-restore",
        };
        write!(f, "{}", name)
    }
}

/// Caller data passed back with every event.
pub type EventContext = Option<Arc<dyn Any + Send + Sync>>;

/// One delivered event.
#[derive(Clone)]
pub struct DeviceEvent {
    /// Originating device.
    pub handle: DeviceHandle,
    /// What happened.
    pub kind: DeviceEventKind,
    /// Context given at registration.
    pub context: EventContext,
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEvent")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

/// Event callback.
pub type EventHandler = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    handler: EventHandler,
    context: EventContext,
}

struct Envelope {
    handle: DeviceHandle,
    kind: DeviceEventKind,
    gate: Option<Arc<RwLock<()>>>,
    ack: Option<oneshot::Sender<()>>,
}

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// True on the thread currently running an event handler.
pub fn in_dispatch() -> bool {
    IN_DISPATCH.with(Cell::get)
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Self {
        IN_DISPATCH.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        IN_DISPATCH.with(|flag| flag.set(false));
    }
}

/// Single-consumer event queue and the handler registration.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Envelope>,
    registration: Arc<Mutex<Option<Registration>>>,
    ack_timeout: Duration,
}

impl Dispatcher {
    /// Start the delivery task. Must be called inside a Tokio runtime.
    pub fn spawn(config: &SessionConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.event_queue_capacity);
        let registration = Arc::new(Mutex::new(None));
        tokio::spawn(Self::run(rx, Arc::clone(&registration)));
        Self {
            tx,
            registration,
            ack_timeout: config.event_ack_timeout(),
        }
    }

    async fn run(mut rx: mpsc::Receiver<Envelope>, registration: Arc<Mutex<Option<Registration>>>) {
        while let Some(envelope) = rx.recv().await {
            let current = registration.lock().clone();
            let Some(Registration { handler, context }) = current else {
                debug!(handle = %envelope.handle, event = %envelope.kind, "no handler, event dropped");
                if let Some(ack) = envelope.ack {
                    let _ = ack.send(());
                }
                continue;
            };

            let _gate = match envelope.gate {
                Some(gate) => Some(gate.write_owned().await),
                None => None,
            };

            let ack = envelope.ack;
            let event = DeviceEvent {
                handle: envelope.handle,
                kind: envelope.kind,
                context,
            };
            debug!(handle = %event.handle, event = %event.kind, "delivering event");
            let delivered = tokio::task::spawn_blocking(move || {
                let _guard = DispatchGuard::enter();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                handler(&event);
            })
            .await;
            if let Err(e) = delivered {
                warn!(error = %e, "event handler panicked");
            }
        }
        debug!("event dispatcher stopped");
    }

    /// Replace the handler; returns the previous one. `None` removes it.
    pub fn register(
        &self,
        handler: Option<EventHandler>,
        context: EventContext,
    ) -> Option<EventHandler> {
        let next = handler.map(|handler| Registration { handler, context });
        let previous = std::mem::replace(&mut *self.registration.lock(), next);
        previous.map(|r| r.handler)
    }

    /// True while a handler is registered.
    pub fn has_handler(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// Queue an event without waiting for delivery.
    pub async fn post(
        &self,
        handle: DeviceHandle,
        kind: DeviceEventKind,
        gate: Option<Arc<RwLock<()>>>,
    ) {
        let envelope = Envelope {
            handle,
            kind,
            gate,
            ack: None,
        };
        self.enqueue(envelope).await;
    }

    /// Queue an event and wait until its delivery has started.
    ///
    /// Called from inside a handler the event is only queued: the
    /// dispatcher is busy with that very handler.
    pub async fn deliver(
        &self,
        handle: DeviceHandle,
        kind: DeviceEventKind,
        gate: Option<Arc<RwLock<()>>>,
    ) {
        if in_dispatch() {
            let envelope = Envelope {
                handle,
                kind,
                gate,
                ack: None,
            };
            if self.tx.try_send(envelope).is_err() {
                warn!(%handle, event = %kind, "event queue full, event dropped");
            }
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let envelope = Envelope {
            handle,
            kind,
            gate,
            ack: Some(ack_tx),
        };
        self.enqueue(envelope).await;
        if tokio::time::timeout(self.ack_timeout, ack_rx).await.is_err() {
            warn!(%handle, event = %kind, "event delivery not started in time");
        }
    }

    async fn enqueue(&self, envelope: Envelope) {
        let (handle, kind) = (envelope.handle, envelope.kind);
        if self.tx.send(envelope).await.is_err() {
            warn!(%handle, event = %kind, "event dispatcher gone, event dropped");
        }
    }
}

/// Emits events on behalf of one device.
#[derive(Clone)]
pub struct EventEmitter {
    dispatcher: Dispatcher,
    handle: DeviceHandle,
    gate: Arc<RwLock<()>>,
}

impl EventEmitter {
    /// Emitter for `handle` guarded by `gate`.
    pub fn new(dispatcher: Dispatcher, handle: DeviceHandle, gate: Arc<RwLock<()>>) -> Self {
        Self {
            dispatcher,
            handle,
            gate,
        }
    }

    /// Emit `kind` and wait until the handler has been reached.
    pub async fn emit(&self, kind: DeviceEventKind) {
        self.dispatcher
            .deliver(self.handle, kind, Some(Arc::clone(&self.gate)))
            .await;
    }
}
