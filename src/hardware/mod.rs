//! Hardware boundary.
//!
//! - [`transport`]: the traits a physical instrument and its bus implement
//! - [`mock`]: a simulated instrument for tests and demos

pub mod mock;
pub mod transport;

pub use mock::{Pass, SimulatedBus, SimulatedInstrument, Strip};
pub use transport::{
    DeviceBus, DeviceCapabilities, Exposure, HardwareSignal, LightSource, RulerSample,
    ScanCapture, ScanSample, Transport, WhiteReference,
};
