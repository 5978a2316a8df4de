//! Device sessions and the handle arena.
//!
//! Every device seen by discovery gets a [`DeviceSlot`] in the [`Registry`],
//! keyed by a generated [`DeviceHandle`]. A slot carries:
//!
//! - a liveness flag, cleared on close or physical disconnect; a dead handle
//!   stays dead, a reconnect yields a new handle
//! - an open flag for the closed → open transition
//! - the button latch, set by the hardware watcher and cleared on read
//! - the control gate, held for writing by the event dispatcher while a
//!   handler runs for this device
//! - the [`DeviceState`] behind an async mutex, which serializes operations
//!   on one handle
//!
//! The transport lives outside the state mutex so that `close` can flush and
//! release it while an operation is still in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::device::DeviceState;
use crate::error::{AppResult, SpectroError};
use crate::hardware::transport::Transport;

/// Opaque identity of one discovered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    /// Handle from its raw value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Connection status of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Unknown, closed or disconnected handle.
    Invalid,
    /// Discovered, not opened.
    Closed,
    /// Opened by this process.
    Open,
}

impl ConnectionStatus {
    /// Raw status code.
    pub fn code(&self) -> u32 {
        match self {
            Self::Invalid => 0x00,
            Self::Closed => 0x01,
            Self::Open => 0x03,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Closed => "closed",
            Self::Open => "open",
        };
        write!(f, "{}", name)
    }
}

/// Button latch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonStatus {
    /// Pressed since the last read.
    Pressed,
    /// Not pressed since the last read.
    NotPressed,
}

impl ButtonStatus {
    /// Raw status code.
    pub fn code(&self) -> u32 {
        match self {
            Self::Pressed => 1000,
            Self::NotPressed => 1001,
        }
    }
}

/// One device record.
pub struct DeviceSlot {
    handle: DeviceHandle,
    transport: Arc<dyn Transport>,
    device_path: String,
    alive: AtomicBool,
    open: AtomicBool,
    button: AtomicBool,
    gate: Arc<tokio::sync::RwLock<()>>,
    state: tokio::sync::Mutex<DeviceState>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceSlot {
    fn new(handle: DeviceHandle, transport: Arc<dyn Transport>, state: DeviceState) -> Self {
        let device_path = transport.capabilities().device_path.clone();
        Self {
            handle,
            transport,
            device_path,
            alive: AtomicBool::new(true),
            open: AtomicBool::new(false),
            button: AtomicBool::new(false),
            gate: Arc::new(tokio::sync::RwLock::new(())),
            state: tokio::sync::Mutex::new(state),
            watcher: Mutex::new(None),
        }
    }

    /// Handle of this slot.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Transport of the device.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Path the device was discovered at.
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Control gate.
    pub fn gate(&self) -> &Arc<tokio::sync::RwLock<()>> {
        &self.gate
    }

    /// Device state; lock to operate.
    pub fn state(&self) -> &tokio::sync::Mutex<DeviceState> {
        &self.state
    }

    /// Pure status query.
    pub fn status(&self) -> ConnectionStatus {
        if !self.alive.load(Ordering::SeqCst) {
            ConnectionStatus::Invalid
        } else if self.open.load(Ordering::SeqCst) {
            ConnectionStatus::Open
        } else {
            ConnectionStatus::Closed
        }
    }

    /// True until closed or disconnected.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Fail with `InvalidHandle` once dead.
    pub fn ensure_alive(&self) -> AppResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SpectroError::InvalidHandle)
        }
    }

    /// Fail unless alive and open.
    pub fn ensure_open(&self) -> AppResult<()> {
        self.ensure_alive()?;
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SpectroError::DeviceNotOpen)
        }
    }

    /// closed → open; `AlreadyOpen` when already open.
    pub fn mark_open(&self) -> AppResult<()> {
        self.open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| SpectroError::AlreadyOpen)
    }

    /// Kill the handle. Returns true for the call that killed it.
    pub fn invalidate(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        was_alive
    }

    /// Stop the hardware signal watcher.
    pub fn stop_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }

    /// Record a button press.
    pub fn latch_button(&self) {
        self.button.store(true, Ordering::SeqCst);
    }

    /// Read and clear the button latch.
    pub fn take_button(&self) -> ButtonStatus {
        if self.button.swap(false, Ordering::SeqCst) {
            ButtonStatus::Pressed
        } else {
            ButtonStatus::NotPressed
        }
    }

    /// Attach the hardware signal watcher.
    pub fn set_watcher(&self, watcher: JoinHandle<()>) {
        if let Some(previous) = self.watcher.lock().replace(watcher) {
            previous.abort();
        }
    }
}

impl Drop for DeviceSlot {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

impl fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("handle", &self.handle)
            .field("device_path", &self.device_path)
            .field("status", &self.status())
            .finish()
    }
}

/// Arena of device slots.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    slots: RwLock<HashMap<DeviceHandle, Arc<DeviceSlot>>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a slot under a fresh handle.
    pub fn insert(&self, transport: Arc<dyn Transport>, state: DeviceState) -> Arc<DeviceSlot> {
        let handle = DeviceHandle(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let slot = Arc::new(DeviceSlot::new(handle, transport, state));
        self.slots.write().insert(handle, Arc::clone(&slot));
        slot
    }

    /// Slot of `handle`, dead or alive.
    pub fn get(&self, handle: DeviceHandle) -> Option<Arc<DeviceSlot>> {
        self.slots.read().get(&handle).cloned()
    }

    /// Live slot discovered at `device_path`.
    pub fn find_live(&self, device_path: &str) -> Option<Arc<DeviceSlot>> {
        self.slots
            .read()
            .values()
            .find(|s| s.is_alive() && s.device_path == device_path)
            .cloned()
    }

    /// Every live slot.
    pub fn live(&self) -> Vec<Arc<DeviceSlot>> {
        let mut slots: Vec<_> = self
            .slots
            .read()
            .values()
            .filter(|s| s.is_alive())
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.handle);
        slots
    }

    /// Drop `handle` from the arena.
    pub fn remove(&self, handle: DeviceHandle) -> Option<Arc<DeviceSlot>> {
        self.slots.write().remove(&handle)
    }

    /// Drop every dead slot.
    pub fn prune(&self) {
        self.slots.write().retain(|_, s| s.is_alive());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpectroConfig;
    use crate::hardware::mock::SimulatedInstrument;

    fn slot(registry: &Registry) -> Arc<DeviceSlot> {
        let device = Arc::new(SimulatedInstrument::new("1000001"));
        let state = DeviceState::new(device.capabilities().clone(), &SpectroConfig::default());
        registry.insert(device, state)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ConnectionStatus::Invalid.code(), 0x00);
        assert_eq!(ConnectionStatus::Closed.code(), 0x01);
        assert_eq!(ConnectionStatus::Open.code(), 0x03);
        assert_eq!(ButtonStatus::Pressed.code(), 1000);
        assert_eq!(ButtonStatus::NotPressed.code(), 1001);
    }

    #[test]
    fn test_lifecycle() {
        let registry = Registry::new();
        let s = slot(&registry);
        assert_eq!(s.status(), ConnectionStatus::Closed);
        assert_eq!(s.ensure_open(), Err(SpectroError::DeviceNotOpen));

        s.mark_open().unwrap();
        assert_eq!(s.mark_open(), Err(SpectroError::AlreadyOpen));
        assert_eq!(s.status(), ConnectionStatus::Open);

        assert!(s.invalidate());
        assert!(!s.invalidate());
        assert_eq!(s.status(), ConnectionStatus::Invalid);
        assert_eq!(s.ensure_open(), Err(SpectroError::InvalidHandle));
    }

    #[test]
    fn test_button_latch() {
        let registry = Registry::new();
        let s = slot(&registry);
        s.latch_button();
        assert_eq!(s.take_button(), ButtonStatus::Pressed);
        assert_eq!(s.take_button(), ButtonStatus::NotPressed);
    }

    #[test]
    fn test_handles_are_never_reused() {
        let registry = Registry::new();
        let a = slot(&registry);
        a.invalidate();
        registry.prune();
        let b = slot(&registry);
        assert_ne!(a.handle(), b.handle());
        assert!(registry.get(a.handle()).is_none());
        assert_eq!(registry.live().len(), 1);
    }
}
