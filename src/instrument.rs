//! Public engine facade.
//!
//! [`Instrument`] is the one entry point applications use. It ties the
//! device bus, the handle registry, the global options and the event
//! dispatcher together and exposes every device operation by handle.
//!
//! # Control Path
//!
//! Every operation on an opened device:
//!
//! 1. resolves the handle (`InvalidHandle` for unknown or dead handles,
//!    `DeviceNotOpen` for discovered but unopened ones)
//! 2. waits for the device gate unless called from an event handler
//! 3. locks the device state, which serializes calls on one handle
//! 4. re-checks liveness before returning, so an operation overtaken by
//!    `close` or a disconnect reports `InvalidHandle`
//!
//! `connection_status` and `button_pressed` skip all of this; they only
//! read atomics.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use spectro_daq::config::SpectroConfig;
//! use spectro_daq::hardware::{SimulatedBus, SimulatedInstrument};
//! use spectro_daq::instrument::Instrument;
//! use spectro_daq::measurement::MeasurementMode;
//!
//! # async fn demo() -> spectro_daq::error::AppResult<()> {
//! let bus = Arc::new(SimulatedBus::new());
//! bus.attach(Arc::new(SimulatedInstrument::new("1000001")));
//!
//! let engine = Instrument::new(bus, SpectroConfig::default());
//! let handle = engine.get_devices().await?[0];
//! engine.open(handle).await?;
//! engine.set_mode(handle, MeasurementMode::ReflectanceSpot).await?;
//! engine.calibrate(handle).await?;
//! engine.trigger(handle).await?;
//! let spectrum = engine.spectrum(handle, 0).await?;
//! # let _ = spectrum;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::SpectroConfig;
use crate::device::DeviceState;
use crate::error::{AppResult, SpectroError};
use crate::events::{in_dispatch, DeviceEventKind, Dispatcher, EventContext, EventEmitter, EventHandler};
use crate::hardware::transport::{DeviceBus, DeviceCapabilities, HardwareSignal};
use crate::measurement::{Densities, MeasurementMode, Spectrum, Tristimulus};
use crate::options::{keys, read_into, required_len, GlobalOptions, RESET_ALL};
use crate::session::{ButtonStatus, ConnectionStatus, DeviceHandle, DeviceSlot, Registry};

struct Inner {
    bus: Arc<dyn DeviceBus>,
    config: SpectroConfig,
    registry: Registry,
    global: Mutex<GlobalOptions>,
    dispatcher: Dispatcher,
}

/// Measurement engine over one device bus.
#[derive(Clone)]
pub struct Instrument {
    inner: Arc<Inner>,
}

/// Fail with `InvalidHandle` if the slot died while the operation ran.
fn settle<T>(slot: &DeviceSlot, result: AppResult<T>) -> AppResult<T> {
    if !slot.is_alive() {
        return Err(SpectroError::InvalidHandle);
    }
    result
}

impl Instrument {
    /// Engine over `bus`. Must be called inside a Tokio runtime.
    pub fn new(bus: Arc<dyn DeviceBus>, config: SpectroConfig) -> Self {
        let dispatcher = Dispatcher::spawn(&config.session);
        Self {
            inner: Arc::new(Inner {
                bus,
                config,
                registry: Registry::new(),
                global: Mutex::new(GlobalOptions::new()),
                dispatcher,
            }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &SpectroConfig {
        &self.inner.config
    }

    fn slot(&self, handle: DeviceHandle) -> AppResult<Arc<DeviceSlot>> {
        self.inner
            .registry
            .get(handle)
            .ok_or(SpectroError::InvalidHandle)
    }

    async fn wait_gate(slot: &DeviceSlot) {
        if !in_dispatch() {
            drop(slot.gate().read().await);
        }
    }

    async fn enter(&self, handle: DeviceHandle) -> AppResult<Arc<DeviceSlot>> {
        let slot = self.slot(handle)?;
        slot.ensure_open()?;
        Self::wait_gate(&slot).await;
        Ok(slot)
    }

    fn emitter(&self, slot: &DeviceSlot) -> EventEmitter {
        EventEmitter::new(
            self.inner.dispatcher.clone(),
            slot.handle(),
            Arc::clone(slot.gate()),
        )
    }

    fn global_no_led(&self) -> bool {
        self.inner.global.lock().no_led_indication()
    }

    // ========================================================================
    // Discovery and session
    // ========================================================================

    /// Enumerate the bus and return the handles of attached devices.
    ///
    /// Newly seen devices get a fresh handle and an `Arrival` event; devices
    /// no longer on the bus are invalidated with a `Departure` event. The
    /// returned list is a snapshot, superseded by the next call.
    pub async fn get_devices(&self) -> AppResult<Vec<DeviceHandle>> {
        let registry = &self.inner.registry;
        let transports = self.inner.bus.enumerate().await?;
        let present: HashSet<String> = transports
            .iter()
            .map(|t| t.capabilities().device_path.clone())
            .collect();

        for slot in registry.live() {
            if !present.contains(slot.device_path()) && slot.invalidate() {
                slot.stop_watcher();
                info!(handle = %slot.handle(), path = slot.device_path(), "device gone");
                self.inner
                    .dispatcher
                    .post(slot.handle(), DeviceEventKind::Departure, None)
                    .await;
            }
        }

        let mut handles = Vec::with_capacity(transports.len());
        for transport in transports {
            let path = transport.capabilities().device_path.clone();
            let slot = match registry.find_live(&path) {
                Some(slot) => slot,
                None => {
                    let state =
                        DeviceState::new(transport.capabilities().clone(), &self.inner.config);
                    let slot = registry.insert(transport, state);
                    self.watch(&slot);
                    info!(handle = %slot.handle(), %path, "device arrived");
                    self.inner
                        .dispatcher
                        .post(slot.handle(), DeviceEventKind::Arrival, None)
                        .await;
                    slot
                }
            };
            handles.push(slot.handle());
        }
        registry.prune();
        Ok(handles)
    }

    fn watch(&self, slot: &Arc<DeviceSlot>) {
        let mut signals = slot.transport().subscribe();
        let weak = Arc::downgrade(slot);
        let dispatcher = self.inner.dispatcher.clone();
        let watcher = tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(HardwareSignal::ButtonPressed) => {
                        let Some(slot) = weak.upgrade() else { break };
                        slot.latch_button();
                        dispatcher
                            .post(
                                slot.handle(),
                                DeviceEventKind::ButtonPressed,
                                Some(Arc::clone(slot.gate())),
                            )
                            .await;
                    }
                    Ok(HardwareSignal::Disconnected) => {
                        let Some(slot) = weak.upgrade() else { break };
                        if slot.invalidate() {
                            info!(handle = %slot.handle(), "device disconnected");
                            dispatcher
                                .post(slot.handle(), DeviceEventKind::Departure, None)
                                .await;
                        }
                        break;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "hardware signals dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        slot.set_watcher(watcher);
    }

    /// Claim a discovered device.
    pub async fn open(&self, handle: DeviceHandle) -> AppResult<()> {
        let slot = self.slot(handle)?;
        slot.ensure_alive()?;
        if slot.status() == ConnectionStatus::Open {
            return Err(SpectroError::AlreadyOpen);
        }
        Self::wait_gate(&slot).await;
        slot.transport().claim().await?;
        slot.mark_open()?;
        info!(%handle, serial = %slot.transport().capabilities().serial_number, "device opened");
        Ok(())
    }

    /// Flush, release and invalidate an opened device.
    ///
    /// Does not wait for an operation in flight; that operation reports
    /// `InvalidHandle`. A later discovery hands out a new handle.
    pub async fn close(&self, handle: DeviceHandle) -> AppResult<()> {
        let slot = self.slot(handle)?;
        slot.ensure_open()?;
        Self::wait_gate(&slot).await;
        Self::shut_down(&slot).await;
        self.inner.registry.remove(handle);
        info!(%handle, "device closed");
        Ok(())
    }

    async fn shut_down(slot: &DeviceSlot) {
        slot.invalidate();
        slot.stop_watcher();
        let transport = slot.transport();
        if let Err(e) = transport.flush().await {
            warn!(handle = %slot.handle(), error = %e, "flush on close failed");
        }
        if let Err(e) = transport.release().await {
            warn!(handle = %slot.handle(), error = %e, "release on close failed");
        }
    }

    /// Connection status; never blocks.
    pub fn connection_status(&self, handle: DeviceHandle) -> ConnectionStatus {
        self.inner
            .registry
            .get(handle)
            .map_or(ConnectionStatus::Invalid, |slot| slot.status())
    }

    /// Read and clear the button latch; never blocks.
    pub fn button_pressed(&self, handle: DeviceHandle) -> AppResult<ButtonStatus> {
        let slot = self.slot(handle)?;
        slot.ensure_alive()?;
        Ok(slot.take_button())
    }

    /// Static description of a discovered device.
    pub fn capabilities(&self, handle: DeviceHandle) -> AppResult<DeviceCapabilities> {
        let slot = self.slot(handle)?;
        slot.ensure_alive()?;
        Ok(slot.transport().capabilities().clone())
    }

    // ========================================================================
    // Measurement
    // ========================================================================

    /// Switch the measurement mode.
    pub async fn set_mode(&self, handle: DeviceHandle, mode: MeasurementMode) -> AppResult<()> {
        let slot = self.enter(handle).await?;
        let mut state = slot.state().lock().await;
        slot.ensure_open()?;
        let result = state.set_mode(slot.transport().as_ref(), mode).await;
        settle(&slot, result)
    }

    /// Active measurement mode.
    pub async fn mode(&self, handle: DeviceHandle) -> AppResult<MeasurementMode> {
        let slot = self.enter(handle).await?;
        let state = slot.state().lock().await;
        settle(&slot, Ok(state.mode()))
    }

    /// Calibrate the active mode; the device must sit on its white tile.
    pub async fn calibrate(&self, handle: DeviceHandle) -> AppResult<()> {
        let slot = self.enter(handle).await?;
        let events = self.emitter(&slot);
        let mut state = slot.state().lock().await;
        slot.ensure_open()?;
        let result = state.calibrate(slot.transport().as_ref(), &events).await;
        settle(&slot, result)
    }

    /// Measure in the active mode.
    pub async fn trigger(&self, handle: DeviceHandle) -> AppResult<()> {
        let slot = self.enter(handle).await?;
        let events = self.emitter(&slot);
        let no_led = self.global_no_led();
        let mut state = slot.state().lock().await;
        slot.ensure_open()?;
        let result = state
            .trigger(slot.transport().as_ref(), &events, no_led)
            .await;
        settle(&slot, result)
    }

    /// Results available under the selected result index.
    pub async fn sample_count(&self, handle: DeviceHandle) -> AppResult<usize> {
        let slot = self.enter(handle).await?;
        let state = slot.state().lock().await;
        settle(&slot, Ok(state.sample_count()))
    }

    /// Spectrum of result `index`.
    pub async fn spectrum(&self, handle: DeviceHandle, index: usize) -> AppResult<Spectrum> {
        let slot = self.enter(handle).await?;
        let state = slot.state().lock().await;
        settle(&slot, state.spectrum(index))
    }

    /// Tristimulus of result `index`.
    pub async fn tristimulus(&self, handle: DeviceHandle, index: usize) -> AppResult<Tristimulus> {
        let slot = self.enter(handle).await?;
        let state = slot.state().lock().await;
        settle(&slot, state.tristimulus(index))
    }

    /// Densities of result `index`.
    pub async fn densities(&self, handle: DeviceHandle, index: usize) -> AppResult<Densities> {
        let slot = self.enter(handle).await?;
        let state = slot.state().lock().await;
        settle(&slot, state.densities(index))
    }

    /// Density of result `index` through the configured filter.
    pub async fn density(&self, handle: DeviceHandle, index: usize) -> AppResult<f64> {
        let slot = self.enter(handle).await?;
        let mut state = slot.state().lock().await;
        settle(&slot, state.density(index))
    }

    /// Chart line for the next correlation scan.
    pub async fn set_reference_line(
        &self,
        handle: DeviceHandle,
        values: Vec<f64>,
        patch_count: usize,
    ) -> AppResult<()> {
        let slot = self.enter(handle).await?;
        let mut state = slot.state().lock().await;
        settle(&slot, state.set_reference_line(values, patch_count))
    }

    /// Paper white for paper-relative colorimetry.
    pub async fn set_substrate(&self, handle: DeviceHandle, substrate: Spectrum) -> AppResult<()> {
        let slot = self.enter(handle).await?;
        let mut state = slot.state().lock().await;
        settle(&slot, state.set_substrate(substrate))
    }

    // ========================================================================
    // Options
    // ========================================================================

    /// Read a device option.
    pub async fn get_option(&self, handle: DeviceHandle, key: &str) -> AppResult<String> {
        let slot = self.enter(handle).await?;
        let no_led = self.global_no_led();
        let state = slot.state().lock().await;
        settle(&slot, state.get_option(key, no_led))
    }

    /// Write a device option.
    pub async fn set_option(&self, handle: DeviceHandle, key: &str, value: &str) -> AppResult<()> {
        let slot = self.enter(handle).await?;
        let mut state = slot.state().lock().await;
        slot.ensure_open()?;
        let result = state
            .set_option(slot.transport().as_ref(), key, value)
            .await;
        debug!(%handle, key, value, ok = result.is_ok(), "device option set");
        settle(&slot, result)
    }

    /// Buffer size a device option needs, terminator included.
    pub async fn option_len(&self, handle: DeviceHandle, key: &str) -> AppResult<usize> {
        Ok(required_len(&self.get_option(handle, key).await?))
    }

    /// Copy a device option into `buffer`; `BufferTooSmall` when it does
    /// not fit.
    pub async fn read_option(
        &self,
        handle: DeviceHandle,
        key: &str,
        buffer: &mut [u8],
    ) -> AppResult<usize> {
        read_into(&self.get_option(handle, key).await?, buffer)
    }

    /// Read a global option.
    pub fn get_global_option(&self, key: &str) -> AppResult<String> {
        self.inner.global.lock().get(key)
    }

    /// Buffer size a global option needs, terminator included.
    pub fn global_option_len(&self, key: &str) -> AppResult<usize> {
        Ok(required_len(&self.get_global_option(key)?))
    }

    /// Copy a global option into `buffer`.
    pub fn read_global_option(&self, key: &str, buffer: &mut [u8]) -> AppResult<usize> {
        read_into(&self.get_global_option(key)?, buffer)
    }

    /// Write a global option.
    ///
    /// `Reset=All` closes every open device, removes the event handler and
    /// restores the global defaults.
    pub async fn set_global_option(&self, key: &str, value: &str) -> AppResult<()> {
        if key != keys::RESET {
            return self.inner.global.lock().set(key, value);
        }
        if value != RESET_ALL {
            return Err(SpectroError::InvalidArgument(format!(
                "unknown reset scope '{}'",
                value
            )));
        }

        let open: Vec<DeviceHandle> = self
            .inner
            .registry
            .live()
            .iter()
            .filter(|s| s.status() == ConnectionStatus::Open)
            .map(|s| s.handle())
            .collect();
        let closed = join_all(open.iter().map(|h| self.close(*h))).await;
        for (handle, result) in open.iter().zip(closed) {
            if let Err(e) = result {
                debug!(%handle, error = %e, "device not closed by reset");
            }
        }
        self.inner.dispatcher.register(None, None);
        self.inner.global.lock().reset();
        info!(closed = open.len(), "engine reset");
        Ok(())
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Install `handler`, returning the one it replaces. `None` removes the
    /// handler; events are then dropped.
    pub fn register_handler(
        &self,
        handler: Option<EventHandler>,
        context: EventContext,
    ) -> Option<EventHandler> {
        self.inner.dispatcher.register(handler, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceEvent;
    use crate::hardware::mock::{SimulatedBus, SimulatedInstrument};

    fn engine() -> (Instrument, Arc<SimulatedBus>, Arc<SimulatedInstrument>) {
        let bus = Arc::new(SimulatedBus::new());
        let device = Arc::new(SimulatedInstrument::new("1000001"));
        bus.attach(Arc::clone(&device));
        let engine = Instrument::new(bus.clone(), SpectroConfig::default());
        (engine, bus, device)
    }

    #[tokio::test]
    async fn test_discovery_is_stable() {
        let (engine, _bus, _device) = engine();
        let first = engine.get_devices().await.unwrap();
        let second = engine.get_devices().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(engine.connection_status(first[0]), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_unopened_handle_is_not_open() {
        let (engine, _bus, _device) = engine();
        let handle = engine.get_devices().await.unwrap()[0];
        assert_eq!(engine.trigger(handle).await, Err(SpectroError::DeviceNotOpen));
        assert_eq!(
            engine.trigger(DeviceHandle::from_raw(99)).await,
            Err(SpectroError::InvalidHandle)
        );
    }

    #[tokio::test]
    async fn test_open_twice() {
        let (engine, _bus, device) = engine();
        let handle = engine.get_devices().await.unwrap()[0];
        engine.open(handle).await.unwrap();
        assert!(device.is_claimed());
        assert_eq!(engine.open(handle).await, Err(SpectroError::AlreadyOpen));
        assert_eq!(engine.connection_status(handle), ConnectionStatus::Open);
    }

    #[tokio::test]
    async fn test_claimed_elsewhere_is_in_use() {
        let (engine, _bus, device) = engine();
        device.set_claimed_elsewhere(true);
        let handle = engine.get_devices().await.unwrap()[0];
        assert_eq!(engine.open(handle).await, Err(SpectroError::AlreadyInUse));
        assert_eq!(engine.connection_status(handle), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_close_invalidates_and_releases() {
        let (engine, _bus, device) = engine();
        let handle = engine.get_devices().await.unwrap()[0];
        engine.open(handle).await.unwrap();
        let flushes = device.flush_count();
        engine.close(handle).await.unwrap();

        assert!(!device.is_claimed());
        assert_eq!(device.flush_count(), flushes + 1);
        assert_eq!(engine.connection_status(handle), ConnectionStatus::Invalid);
        assert_eq!(engine.close(handle).await, Err(SpectroError::InvalidHandle));

        let again = engine.get_devices().await.unwrap();
        assert_ne!(again[0], handle);
    }

    #[tokio::test]
    async fn test_global_options() {
        let (engine, _bus, _device) = engine();
        assert_eq!(
            engine.get_global_option(keys::SDK_VERSION).unwrap(),
            crate::options::SDK_VERSION
        );
        engine
            .set_global_option(keys::NO_LED_INDICATION, "1")
            .await
            .unwrap();
        assert_eq!(engine.get_global_option(keys::NO_LED_INDICATION).unwrap(), "1");
        assert_eq!(engine.global_option_len(keys::NO_LED_INDICATION).unwrap(), 2);

        let mut small = [0u8; 1];
        assert!(matches!(
            engine.read_global_option(keys::NO_LED_INDICATION, &mut small),
            Err(SpectroError::BufferTooSmall { required: 2, provided: 1 })
        ));
    }

    #[tokio::test]
    async fn test_global_reset_closes_devices() {
        let (engine, _bus, device) = engine();
        let handle = engine.get_devices().await.unwrap()[0];
        engine.open(handle).await.unwrap();
        engine.register_handler(Some(Arc::new(|_: &DeviceEvent| {})), None);
        engine
            .set_global_option(keys::NO_LED_INDICATION, "1")
            .await
            .unwrap();

        engine.set_global_option(keys::RESET, RESET_ALL).await.unwrap();
        assert_eq!(engine.connection_status(handle), ConnectionStatus::Invalid);
        assert!(!device.is_claimed());
        assert!(engine.register_handler(None, None).is_none());
        assert_eq!(engine.get_global_option(keys::NO_LED_INDICATION).unwrap(), "0");
    }
}
