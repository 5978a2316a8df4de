//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spectro_daq::config::SpectroConfig;
use spectro_daq::hardware::{SimulatedBus, SimulatedInstrument};
use spectro_daq::{DeviceEvent, DeviceEventKind, DeviceHandle, EventHandler, Instrument, MeasurementMode};

/// Engine with one simulated instrument on its bus.
pub struct Rig {
    pub engine: Instrument,
    pub bus: Arc<SimulatedBus>,
    pub device: Arc<SimulatedInstrument>,
    pub handle: DeviceHandle,
}

/// Discover `device` and return the rig without opening it.
pub async fn discovered(device: SimulatedInstrument) -> Rig {
    let bus = Arc::new(SimulatedBus::new());
    let device = Arc::new(device);
    bus.attach(Arc::clone(&device));
    let engine = Instrument::new(bus.clone(), SpectroConfig::default());
    let handle = engine.get_devices().await.expect("discovery")[0];
    Rig {
        engine,
        bus,
        device,
        handle,
    }
}

/// Discovered and opened default instrument.
pub async fn open_rig() -> Rig {
    open_device(SimulatedInstrument::new("1000001")).await
}

/// Discovered and opened `device`.
pub async fn open_device(device: SimulatedInstrument) -> Rig {
    let rig = discovered(device).await;
    rig.engine.open(rig.handle).await.expect("open");
    rig
}

/// Set `mode` and calibrate it.
pub async fn calibrate(rig: &Rig, mode: MeasurementMode) {
    rig.engine.set_mode(rig.handle, mode).await.expect("set mode");
    rig.engine.calibrate(rig.handle).await.expect("calibrate");
}

/// Events seen by a recording handler.
pub type Recorded = Arc<Mutex<Vec<(DeviceHandle, DeviceEventKind)>>>;

/// Handler that records every event it receives.
pub fn recorder() -> (EventHandler, Recorded) {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: EventHandler = Arc::new(move |event: &DeviceEvent| {
        sink.lock().push((event.handle, event.kind));
    });
    (handler, seen)
}

/// Wait up to one second for `predicate` to hold.
pub async fn eventually(mut predicate: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
