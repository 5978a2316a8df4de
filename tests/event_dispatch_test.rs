//! Event delivery through the engine: ordering, context, gating and
//! re-entrant handlers.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{calibrate, eventually, open_rig, recorder};
use parking_lot::Mutex;
use spectro_daq::config::SpectroConfig;
use spectro_daq::hardware::{Pass, SimulatedBus, SimulatedInstrument, Strip};
use spectro_daq::options::keys;
use spectro_daq::{
    ButtonStatus, DeviceEvent, DeviceEventKind, EventHandler, Instrument, MeasurementMode,
};

#[tokio::test]
async fn test_arrival_carries_registration_context() {
    let bus = Arc::new(SimulatedBus::new());
    bus.attach(Arc::new(SimulatedInstrument::new("1000001")));
    let engine = Instrument::new(bus, SpectroConfig::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.register_handler(
        Some(Arc::new(move |event: &DeviceEvent| {
            let label = event
                .context
                .as_ref()
                .and_then(|c| c.downcast_ref::<String>())
                .cloned();
            sink.lock().push((event.handle, event.kind, label));
        })),
        Some(Arc::new("bench-1".to_string())),
    );

    let handle = engine.get_devices().await.unwrap()[0];
    assert!(
        eventually(|| seen.lock().contains(&(
            handle,
            DeviceEventKind::Arrival,
            Some("bench-1".to_string())
        )))
        .await
    );
}

#[tokio::test]
async fn test_register_handler_returns_previous() {
    let rig = open_rig().await;
    let (first, _) = recorder();
    let (second, _) = recorder();

    assert!(rig
        .engine
        .register_handler(Some(Arc::clone(&first)), None)
        .is_none());
    let previous = rig.engine.register_handler(Some(second), None).unwrap();
    assert!(Arc::ptr_eq(&previous, &first));
    assert!(rig.engine.register_handler(None, None).is_some());
    assert!(rig.engine.register_handler(None, None).is_none());
}

#[tokio::test]
async fn test_scan_announces_ready_to_move() {
    let rig = open_rig().await;
    let strip = Strip::test_chart(4, 10.0);
    rig.device.set_strip(strip.clone());
    rig.device.queue_pass(Pass::over(&strip));
    rig.engine
        .set_option(rig.handle, keys::RECOGNITION, "RecognitionBasic")
        .await
        .unwrap();
    calibrate(&rig, MeasurementMode::ReflectanceScan).await;

    let (handler, seen) = recorder();
    rig.engine.register_handler(Some(handler), None);
    rig.engine.trigger(rig.handle).await.unwrap();

    let handle = rig.handle;
    assert!(
        eventually(|| seen
            .lock()
            .contains(&(handle, DeviceEventKind::ScanReadyToMove)))
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_operations_wait_for_running_handler() {
    let rig = open_rig().await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (started_flag, finished_flag) = (Arc::clone(&started), Arc::clone(&finished));
    let handler: EventHandler = Arc::new(move |event: &DeviceEvent| {
        if event.kind == DeviceEventKind::ButtonPressed {
            started_flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            finished_flag.store(true, Ordering::SeqCst);
        }
    });
    rig.engine.register_handler(Some(handler), None);

    rig.device.press_button();
    assert!(eventually(|| started.load(Ordering::SeqCst)).await);

    // Status queries never wait on the gate.
    assert_eq!(
        rig.engine.button_pressed(rig.handle),
        Ok(ButtonStatus::Pressed)
    );
    assert!(!finished.load(Ordering::SeqCst));

    rig.engine
        .set_mode(rig.handle, MeasurementMode::ReflectanceSpot)
        .await
        .unwrap();
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trigger_waits_for_scan_handler() {
    let rig = open_rig().await;
    let strip = Strip::test_chart(4, 10.0);
    rig.device.set_strip(strip.clone());
    rig.device.queue_pass(Pass::over(&strip));
    rig.device.queue_pass(Pass::over(&strip));
    rig.engine
        .set_option(rig.handle, keys::RECOGNITION, "RecognitionBasic")
        .await
        .unwrap();
    calibrate(&rig, MeasurementMode::ReflectanceScan).await;

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (started_flag, finished_flag) = (Arc::clone(&started), Arc::clone(&finished));
    let handler: EventHandler = Arc::new(move |event: &DeviceEvent| {
        if event.kind == DeviceEventKind::ScanReadyToMove {
            started_flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            finished_flag.store(true, Ordering::SeqCst);
        }
    });
    rig.engine.register_handler(Some(handler), None);

    let handle = rig.handle;
    let engine = rig.engine.clone();
    let first = tokio::spawn(async move { engine.trigger(handle).await });
    assert!(eventually(|| started.load(Ordering::SeqCst)).await);
    assert!(!finished.load(Ordering::SeqCst));

    let engine = rig.engine.clone();
    let second = tokio::spawn(async move { engine.trigger(handle).await });
    second.await.unwrap().unwrap();
    assert!(finished.load(Ordering::SeqCst));
    first.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_may_call_back_into_engine() {
    let rig = open_rig().await;
    rig.engine
        .set_mode(rig.handle, MeasurementMode::EmissionSpot)
        .await
        .unwrap();

    let observed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&observed);
    let engine = rig.engine.clone();
    let handler: EventHandler = Arc::new(move |event: &DeviceEvent| {
        if event.kind != DeviceEventKind::ButtonPressed {
            return;
        }
        let runtime = tokio::runtime::Handle::current();
        let mode = runtime.block_on(engine.get_option(event.handle, keys::MEASUREMENT_MODE));
        *sink.lock() = Some(mode);
    });
    rig.engine.register_handler(Some(handler), None);

    rig.device.press_button();
    assert!(eventually(|| observed.lock().is_some()).await);
    assert_eq!(
        observed.lock().clone(),
        Some(Ok("EmissionSpot".to_string()))
    );
}

#[tokio::test]
async fn test_button_latch_works_without_handler() {
    let rig = open_rig().await;
    rig.device.press_button();
    let engine = rig.engine.clone();
    let handle = rig.handle;
    assert!(eventually(|| engine.button_pressed(handle) == Ok(ButtonStatus::Pressed)).await);
}
