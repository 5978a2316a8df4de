//! Simulated Instrument
//!
//! A software instrument for tests and the demo binary. It models the
//! optics just enough for the engine's algorithms to have something real to
//! chew on:
//!
//! - a tungsten lamp and a UV LED with fixed raw signal curves
//! - a target under the aperture (reflectance, fluorescence, emission)
//! - a printed strip of patches with zebra ruler edge markers
//! - scripted operator passes over that strip (start delay, speed, range)
//!
//! All waiting uses `tokio::time::sleep`, so tests can run with paused time.
//! Latency is zero by default.
//!
//! # Fault Injection
//!
//! `fail_next`, `set_on_white_tile`, `set_wavelength_shift`, `set_corrupt`,
//! `set_lamp_drift` and `set_claimed_elsewhere` drive the error paths;
//! `press_button` and `disconnect` raise hardware signals.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{AppResult, SpectroError};
use crate::hardware::transport::{
    DeviceBus, DeviceCapabilities, Exposure, HardwareSignal, LightSource, RulerSample,
    ScanCapture, ScanSample, Transport, WhiteReference,
};
use crate::measurement::{IndicatorLed, Spectrum};

/// Signal level of the dark reference.
const DARK_LEVEL: f64 = 0.001;

/// Ruler resolution used when synthesising passes.
const STEP_MM: f64 = 0.5;

/// Interval of stationary reports before the operator starts moving.
const IDLE_REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Raw tungsten signal of the white tile.
pub fn tungsten_white() -> Spectrum {
    Spectrum::from_fn(|nm| 0.2 + 0.7 * (nm - 380.0) / 350.0)
}

/// Raw UV LED signal of the white tile.
pub fn uv_white() -> Spectrum {
    Spectrum::from_fn(|nm| {
        let t = (nm - 420.0) / 40.0;
        0.1 + 0.5 * (-0.5 * t * t).exp()
    })
}

/// Deterministic, clearly distinct reflectance for patch `index`.
pub fn patch_reflectance(index: usize) -> Spectrum {
    let centre = 420.0 + ((index * 110) % 300) as f64;
    let depth = 0.35 + 0.1 * (index % 4) as f64;
    Spectrum::from_fn(|nm| {
        let t = (nm - centre) / 45.0;
        0.08 + depth * (-0.5 * t * t).exp() + 0.02 * (index % 3) as f64
    })
}

/// Typical optical brightener fluorescence, scaled by `strength`.
pub fn brightener_fluorescence(strength: f64) -> Spectrum {
    Spectrum::from_fn(|nm| {
        let t = (nm - 440.0) / 25.0;
        strength * (-0.5 * t * t).exp()
    })
}

/// A printed strip of equally wide patches starting at ruler position 0.
#[derive(Debug, Clone)]
pub struct Strip {
    /// Reflectance of each patch.
    pub patches: Vec<Spectrum>,
    /// UV-excited fluorescence of each patch (relative to the UV white).
    pub fluorescence: Vec<Spectrum>,
    /// Width of one patch.
    pub patch_width_mm: f64,
    /// Reflectance outside the patches.
    pub paper: Spectrum,
}

impl Strip {
    /// Strip of `count` distinct patches without fluorescence.
    pub fn test_chart(count: usize, patch_width_mm: f64) -> Self {
        Self {
            patches: (0..count).map(patch_reflectance).collect(),
            fluorescence: vec![Spectrum::flat(0.0); count],
            patch_width_mm,
            paper: Spectrum::flat(0.9),
        }
    }

    /// Give every patch the same brightener fluorescence.
    pub fn with_fluorescence(mut self, strength: f64) -> Self {
        self.fluorescence = vec![brightener_fluorescence(strength); self.patches.len()];
        self
    }

    /// Printed length.
    pub fn length_mm(&self) -> f64 {
        self.patches.len() as f64 * self.patch_width_mm
    }

    /// Patch under `position_mm`, if any.
    fn patch_at(&self, position_mm: f64) -> Option<usize> {
        if position_mm < 0.0 || self.patch_width_mm <= 0.0 {
            return None;
        }
        let index = (position_mm / self.patch_width_mm) as usize;
        (index < self.patches.len()).then_some(index)
    }

    /// Edge markers lie on every patch boundary.
    fn crosses_edge(&self, from_mm: f64, to_mm: f64) -> bool {
        if self.patch_width_mm <= 0.0 {
            return false;
        }
        let (lo, hi) = if from_mm <= to_mm {
            (from_mm, to_mm)
        } else {
            (to_mm, from_mm)
        };
        (0..=self.patches.len()).any(|k| {
            let edge = k as f64 * self.patch_width_mm;
            edge > lo && edge <= hi
        })
    }
}

/// One scripted operator pass.
#[derive(Debug, Clone)]
pub struct Pass {
    /// Ruler position where the pass starts.
    pub from_mm: f64,
    /// Ruler position where the pass ends.
    pub to_mm: f64,
    /// Time between trigger and the first movement.
    pub start_delay: Duration,
    /// Hand speed.
    pub speed_mm_per_s: f64,
    /// Whether the ruler reports positions.
    pub with_ruler: bool,
}

impl Pass {
    /// Left-to-right pass over `strip` with a small margin on both sides.
    pub fn over(strip: &Strip) -> Self {
        Self {
            from_mm: -5.0,
            to_mm: strip.length_mm() + 5.0,
            start_delay: Duration::from_millis(800),
            speed_mm_per_s: 50.0,
            with_ruler: true,
        }
    }

    /// The same pass in the opposite direction.
    pub fn reversed(mut self) -> Self {
        std::mem::swap(&mut self.from_mm, &mut self.to_mm);
        self
    }

    /// Operator places the device and never moves it.
    pub fn stationary(at_mm: f64) -> Self {
        Self {
            from_mm: at_mm,
            to_mm: at_mm,
            start_delay: Duration::from_millis(800),
            speed_mm_per_s: 50.0,
            with_ruler: true,
        }
    }

    /// Set the start delay.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Set the hand speed.
    pub fn with_speed(mut self, speed_mm_per_s: f64) -> Self {
        self.speed_mm_per_s = speed_mm_per_s;
        self
    }

    /// Drop the ruler stream.
    pub fn without_ruler(mut self) -> Self {
        self.with_ruler = false;
        self
    }
}

/// What the aperture currently sees outside of scans.
#[derive(Debug, Clone)]
struct Target {
    reflectance: Spectrum,
    fluorescence: Spectrum,
    emission: Spectrum,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    claimed: bool,
    claimed_elsewhere: bool,
    on_white_tile: bool,
    wavelength_shift_nm: f64,
    corrupt: bool,
    lamp_drift: f64,
    target: Target,
    strip: Strip,
    passes: VecDeque<Pass>,
    flashes: VecDeque<Vec<Spectrum>>,
    position_streaming: bool,
    indicator: Option<IndicatorLed>,
    fail_next: Option<SpectroError>,
    noise: f64,
    rng: StdRng,
}

/// A simulated spectrophotometer.
pub struct SimulatedInstrument {
    capabilities: DeviceCapabilities,
    state: Mutex<SimState>,
    signals: broadcast::Sender<HardwareSignal>,
    latency: Duration,
    lamp_restore_time: Duration,
    io_count: AtomicUsize,
    flush_count: AtomicUsize,
    lamp_restores: AtomicUsize,
    adaptive_reads: AtomicUsize,
}

impl SimulatedInstrument {
    /// Fully featured instrument (UV LED, zebra ruler, ambient diffuser).
    pub fn new(serial_number: &str) -> Self {
        Self::with_capabilities(DeviceCapabilities {
            serial_number: serial_number.to_string(),
            hw_revision: "E".to_string(),
            supplier_name: "Simulated".to_string(),
            device_path: format!("sim://{}", uuid::Uuid::new_v4()),
            has_uv_led: true,
            has_uv_cut_filter: false,
            has_wavelength_led: true,
            has_zebra_ruler: true,
            has_indicator_led: true,
            has_ambient_light: true,
            has_low_resolution: true,
            max_ruler_length_mm: 300.0,
        })
    }

    /// Instrument with a given description.
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            capabilities,
            state: Mutex::new(SimState {
                connected: true,
                claimed: false,
                claimed_elsewhere: false,
                on_white_tile: true,
                wavelength_shift_nm: 0.0,
                corrupt: false,
                lamp_drift: 0.0,
                target: Target {
                    reflectance: Spectrum::flat(0.5),
                    fluorescence: Spectrum::flat(0.0),
                    emission: Spectrum::flat(0.0),
                },
                strip: Strip::test_chart(10, 10.0),
                passes: VecDeque::new(),
                flashes: VecDeque::new(),
                position_streaming: false,
                indicator: None,
                fail_next: None,
                noise: 0.0,
                rng: StdRng::seed_from_u64(0x5eed),
            }),
            signals,
            latency: Duration::ZERO,
            lamp_restore_time: Duration::ZERO,
            io_count: AtomicUsize::new(0),
            flush_count: AtomicUsize::new(0),
            lamp_restores: AtomicUsize::new(0),
            adaptive_reads: AtomicUsize::new(0),
        }
    }

    /// Delay every measurement I/O by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Time a lamp restore takes (the real device needs about two minutes).
    pub fn with_lamp_restore_time(mut self, duration: Duration) -> Self {
        self.lamp_restore_time = duration;
        self
    }

    /// Uniform noise of `amplitude` on every raw band.
    pub fn with_noise(self, amplitude: f64) -> Self {
        self.state.lock().noise = amplitude;
        self
    }

    // -------------------------------------------------------------------------
    // Scenario control
    // -------------------------------------------------------------------------

    /// Put a reflective sample under the aperture.
    pub fn set_reflectance(&self, reflectance: Spectrum) {
        self.state.lock().target.reflectance = reflectance;
    }

    /// Fluorescence of the sample under the aperture.
    pub fn set_fluorescence(&self, fluorescence: Spectrum) {
        self.state.lock().target.fluorescence = fluorescence;
    }

    /// Point the instrument at an emitting surface.
    pub fn set_emission(&self, radiance: Spectrum) {
        self.state.lock().target.emission = radiance;
    }

    /// Lay a strip under the ruler.
    pub fn set_strip(&self, strip: Strip) {
        self.state.lock().strip = strip;
    }

    /// Queue the operator's next pass.
    pub fn queue_pass(&self, pass: Pass) {
        self.state.lock().passes.push_back(pass);
    }

    /// Queue flashes for the next ambient scan.
    pub fn queue_flashes(&self, flashes: Vec<Spectrum>) {
        self.state.lock().flashes.push_back(flashes);
    }

    /// Place or lift the instrument from its tile.
    pub fn set_on_white_tile(&self, on_tile: bool) {
        self.state.lock().on_white_tile = on_tile;
    }

    /// Wavelength shift reported by the next references.
    pub fn set_wavelength_shift(&self, shift_nm: f64) {
        self.state.lock().wavelength_shift_nm = shift_nm;
    }

    /// Make references read back as garbage.
    pub fn set_corrupt(&self, corrupt: bool) {
        self.state.lock().corrupt = corrupt;
    }

    /// Lamp drift reported by the drift check.
    pub fn set_lamp_drift(&self, drift: f64) {
        self.state.lock().lamp_drift = drift;
    }

    /// Pretend another process holds the device.
    pub fn set_claimed_elsewhere(&self, claimed: bool) {
        self.state.lock().claimed_elsewhere = claimed;
    }

    /// Fail the next I/O call with `error`.
    pub fn fail_next(&self, error: SpectroError) {
        self.state.lock().fail_next = Some(error);
    }

    /// Press the measure button.
    pub fn press_button(&self) {
        let _ = self.signals.send(HardwareSignal::ButtonPressed);
    }

    /// Unplug the instrument.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.claimed = false;
            state.position_streaming = false;
        }
        let _ = self.signals.send(HardwareSignal::Disconnected);
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Measurement I/O calls made so far.
    pub fn io_count(&self) -> usize {
        self.io_count.load(Ordering::SeqCst)
    }

    /// Buffer flushes so far.
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    /// Lamp restores so far.
    pub fn lamp_restores(&self) -> usize {
        self.lamp_restores.load(Ordering::SeqCst)
    }

    /// Spot readings taken with adaptive exposure.
    pub fn adaptive_reads(&self) -> usize {
        self.adaptive_reads.load(Ordering::SeqCst)
    }

    /// Whether this process holds the device.
    pub fn is_claimed(&self) -> bool {
        self.state.lock().claimed
    }

    /// Whether ruler positions are streamed between passes.
    pub fn position_streaming(&self) -> bool {
        self.state.lock().position_streaming
    }

    /// Last LED sequence shown.
    pub fn indicator(&self) -> Option<IndicatorLed> {
        self.state.lock().indicator
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn begin_io(&self) -> AppResult<()> {
        self.io_count.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if !state.connected {
            return Err(SpectroError::NotConnected);
        }
        if !state.claimed {
            return Err(SpectroError::DeviceNotOpen);
        }
        Ok(())
    }

    fn white_for(source: LightSource) -> Spectrum {
        match source {
            LightSource::Tungsten => tungsten_white(),
            LightSource::Ultraviolet => uv_white(),
            LightSource::Emissive | LightSource::Ambient => Spectrum::flat(DARK_LEVEL),
        }
    }

    fn noisy(state: &mut SimState, spectrum: Spectrum, scale: f64) -> Spectrum {
        let amplitude = state.noise * scale;
        if amplitude <= 0.0 {
            return spectrum;
        }
        let rng = &mut state.rng;
        spectrum.map(|v| v + rng.gen_range(-amplitude..amplitude))
    }

    fn strip_signal(state: &mut SimState, source: LightSource, position_mm: f64) -> Spectrum {
        let white = Self::white_for(source);
        let patch = state.strip.patch_at(position_mm);
        let signal = match (source, patch) {
            (LightSource::Ultraviolet, Some(i)) => white.zip_map(&state.strip.fluorescence[i], |w, f| w * f),
            (LightSource::Ultraviolet, None) => Spectrum::flat(0.0),
            (_, Some(i)) => white.zip_map(&state.strip.patches[i], |w, r| w * r),
            (_, None) => white.zip_map(&state.strip.paper, |w, r| w * r),
        };
        Self::noisy(state, signal, 1.0)
    }

    fn synthesize_pass(state: &mut SimState, source: LightSource, pass: &Pass) -> ScanCapture {
        let mut capture = ScanCapture::default();

        // Stationary reports while the operator waits for the go signal.
        let mut t = Duration::ZERO;
        while t < pass.start_delay {
            let spectrum = Self::strip_signal(state, source, pass.from_mm);
            capture.samples.push(ScanSample { elapsed: t, spectrum });
            if pass.with_ruler {
                capture.ruler.push(RulerSample {
                    elapsed: t,
                    position_mm: pass.from_mm,
                    edge: false,
                });
            }
            t += IDLE_REPORT_INTERVAL;
        }

        let travel = (pass.to_mm - pass.from_mm).abs();
        let direction = if pass.to_mm >= pass.from_mm { 1.0 } else { -1.0 };
        let steps = (travel / STEP_MM).round() as usize;
        let speed = pass.speed_mm_per_s.max(f64::EPSILON);
        let mut previous = pass.from_mm;
        for step in 1..=steps {
            let position = pass.from_mm + direction * step as f64 * STEP_MM;
            let elapsed = pass.start_delay + Duration::from_secs_f64(step as f64 * STEP_MM / speed);
            let spectrum = Self::strip_signal(state, source, position);
            capture.samples.push(ScanSample { elapsed, spectrum });
            if pass.with_ruler {
                let edge = state.strip.crosses_edge(previous, position);
                capture.ruler.push(RulerSample {
                    elapsed,
                    position_mm: position,
                    edge,
                });
            }
            previous = position;
        }
        capture
    }

    fn synthesize_flashes(state: &mut SimState, flashes: &[Spectrum]) -> ScanCapture {
        let mut capture = ScanCapture::default();
        let ambient = Spectrum::flat(DARK_LEVEL + 0.002);
        let mut t = Duration::ZERO;
        let tick = Duration::from_millis(20);
        let push = |capture: &mut ScanCapture, spectrum: Spectrum, t: &mut Duration| {
            capture.samples.push(ScanSample {
                elapsed: *t,
                spectrum,
            });
            *t += tick;
        };
        for _ in 0..10 {
            push(&mut capture, ambient.clone(), &mut t);
        }
        for flash in flashes {
            let peak = flash.map(|v| v + DARK_LEVEL);
            let shoulder = flash.map(|v| 0.5 * v + DARK_LEVEL);
            push(&mut capture, shoulder.clone(), &mut t);
            push(&mut capture, Self::noisy(state, peak, 1.0), &mut t);
            push(&mut capture, shoulder, &mut t);
            for _ in 0..10 {
                push(&mut capture, ambient.clone(), &mut t);
            }
        }
        capture
    }
}

#[async_trait]
impl Transport for SimulatedInstrument {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn subscribe(&self) -> broadcast::Receiver<HardwareSignal> {
        self.signals.subscribe()
    }

    async fn claim(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SpectroError::NotConnected);
        }
        if state.claimed_elsewhere {
            return Err(SpectroError::AlreadyInUse);
        }
        state.claimed = true;
        debug!(serial = %self.capabilities.serial_number, "simulated device claimed");
        Ok(())
    }

    async fn release(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.claimed = false;
        state.position_streaming = false;
        Ok(())
    }

    async fn flush(&self) -> AppResult<()> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_on_white_tile(&self) -> AppResult<bool> {
        self.begin_io().await?;
        Ok(self.state.lock().on_white_tile)
    }

    async fn read_reference(&self, source: LightSource) -> AppResult<WhiteReference> {
        self.begin_io().await?;
        let mut state = self.state.lock();
        let spectrum = if state.corrupt {
            Spectrum::flat(f64::NAN)
        } else {
            let white = Self::white_for(source);
            Self::noisy(&mut state, white, 0.1)
        };
        Ok(WhiteReference {
            spectrum,
            wavelength_shift_nm: state.wavelength_shift_nm,
        })
    }

    async fn lamp_drift(&self) -> AppResult<f64> {
        self.begin_io().await?;
        Ok(self.state.lock().lamp_drift)
    }

    async fn restore_lamp(&self) -> AppResult<()> {
        self.begin_io().await?;
        if !self.lamp_restore_time.is_zero() {
            tokio::time::sleep(self.lamp_restore_time).await;
        }
        self.state.lock().lamp_drift = 0.0;
        self.lamp_restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_spot(&self, source: LightSource, exposure: Exposure) -> AppResult<Spectrum> {
        self.begin_io().await?;
        let noise_scale = match exposure {
            Exposure::Adaptive => {
                self.adaptive_reads.fetch_add(1, Ordering::SeqCst);
                0.5
            }
            Exposure::Fixed => 1.0,
        };
        let mut state = self.state.lock();
        let white = Self::white_for(source);
        let signal = match source {
            LightSource::Tungsten => white.zip_map(&state.target.reflectance, |w, r| w * r),
            LightSource::Ultraviolet => white.zip_map(&state.target.fluorescence, |w, f| w * f),
            LightSource::Emissive | LightSource::Ambient => {
                white.zip_map(&state.target.emission, |d, e| d + e)
            }
        };
        Ok(Self::noisy(&mut state, signal, noise_scale))
    }

    async fn prepare_scan(&self, _source: LightSource) -> AppResult<()> {
        self.begin_io().await
    }

    async fn capture_scan(&self, source: LightSource, _limit: Duration) -> AppResult<ScanCapture> {
        self.begin_io().await?;
        let mut state = self.state.lock();
        if source == LightSource::Ambient {
            let flashes = state.flashes.pop_front().unwrap_or_default();
            return Ok(Self::synthesize_flashes(&mut state, &flashes));
        }
        let pass = match state.passes.pop_front() {
            Some(pass) => pass,
            None => Pass::stationary(0.0),
        };
        let capture = Self::synthesize_pass(&mut state, source, &pass);
        debug!(
            samples = capture.samples.len(),
            ruler = capture.ruler.len(),
            %source,
            "simulated pass captured"
        );
        Ok(capture)
    }

    async fn set_position_streaming(&self, enabled: bool) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SpectroError::NotConnected);
        }
        state.position_streaming = enabled;
        Ok(())
    }

    async fn set_indicator(&self, led: IndicatorLed) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SpectroError::NotConnected);
        }
        state.indicator = Some(led);
        Ok(())
    }
}

/// A bus with simulated instruments plugged in and out at will.
#[derive(Default)]
pub struct SimulatedBus {
    devices: Mutex<Vec<Arc<SimulatedInstrument>>>,
}

impl SimulatedBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug an instrument in.
    pub fn attach(&self, device: Arc<SimulatedInstrument>) {
        self.devices.lock().push(device);
    }

    /// Unplug the instrument with `serial_number`.
    pub fn detach(&self, serial_number: &str) -> Option<Arc<SimulatedInstrument>> {
        let mut devices = self.devices.lock();
        let position = devices
            .iter()
            .position(|d| d.capabilities().serial_number == serial_number)?;
        let device = devices.remove(position);
        device.disconnect();
        Some(device)
    }
}

#[async_trait]
impl DeviceBus for SimulatedBus {
    async fn enumerate(&self) -> AppResult<Vec<Arc<dyn Transport>>> {
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn Transport>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_io_requires_claim() {
        let device = SimulatedInstrument::new("1");
        assert_eq!(
            device.is_on_white_tile().await,
            Err(SpectroError::DeviceNotOpen)
        );
        device.claim().await.unwrap();
        assert!(device.is_on_white_tile().await.unwrap());
    }

    #[tokio::test]
    async fn test_claimed_elsewhere() {
        let device = SimulatedInstrument::new("1");
        device.set_claimed_elsewhere(true);
        assert_eq!(device.claim().await, Err(SpectroError::AlreadyInUse));
    }

    #[tokio::test]
    async fn test_pass_edges_bound_every_patch() {
        let device = SimulatedInstrument::new("1");
        let strip = Strip::test_chart(4, 10.0);
        device.set_strip(strip.clone());
        device.queue_pass(Pass::over(&strip));
        device.claim().await.unwrap();

        let capture = device
            .capture_scan(LightSource::Tungsten, Duration::from_secs(20))
            .await
            .unwrap();
        let edges = capture.ruler.iter().filter(|r| r.edge).count();
        assert_eq!(edges, 5);
        assert_eq!(capture.samples.len(), capture.ruler.len());
    }

    #[tokio::test]
    async fn test_default_pass_does_not_move() {
        let device = SimulatedInstrument::new("1");
        device.claim().await.unwrap();
        let capture = device
            .capture_scan(LightSource::Tungsten, Duration::from_secs(20))
            .await
            .unwrap();
        assert!(capture.ruler.iter().all(|r| r.position_mm == 0.0));
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let device = SimulatedInstrument::new("1");
        device.claim().await.unwrap();
        device.fail_next(SpectroError::UsbPowerProblem);
        assert_eq!(
            device.lamp_drift().await,
            Err(SpectroError::UsbPowerProblem)
        );
        assert!(device.lamp_drift().await.is_ok());
    }

    #[tokio::test]
    async fn test_bus_detach_signals_disconnect() {
        let bus = SimulatedBus::new();
        let device = Arc::new(SimulatedInstrument::new("42"));
        let mut signals = device.subscribe();
        bus.attach(Arc::clone(&device));
        assert_eq!(bus.enumerate().await.unwrap().len(), 1);

        bus.detach("42").unwrap();
        assert!(bus.enumerate().await.unwrap().is_empty());
        assert_eq!(signals.recv().await.unwrap(), HardwareSignal::Disconnected);
    }
}
