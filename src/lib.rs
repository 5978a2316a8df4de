//! Session, calibration and scan engine for handheld spectrophotometers.
//!
//! The crate drives an instrument through its measurement life cycle:
//! discovery, open, per-mode calibration, triggering and result access. Scan
//! modes turn the raw sample and ruler streams of one or two passes over a
//! printed strip into per-patch results.
//!
//! # Layout
//!
//! - [`instrument`]: the public facade, one [`instrument::Instrument`] per
//!   device bus
//! - [`session`] and [`device`]: per-handle records and measurement state
//! - [`calibration`], [`mode`], [`scan`]: the state machines and algorithms
//! - [`events`]: asynchronous device events
//! - [`options`], [`colorimetry`], [`measurement`]: option protocol and
//!   result types
//! - [`hardware`]: the transport boundary and a simulated instrument
//! - [`config`], [`logging`], [`error`]: ambient infrastructure

pub mod calibration;
pub mod colorimetry;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod mode;
pub mod options;
pub mod scan;
pub mod session;

pub use error::{AppResult, ErrorCategory, SpectroError};
pub use events::{DeviceEvent, DeviceEventKind, EventHandler};
pub use instrument::Instrument;
pub use measurement::{IlluminationCondition, MeasurementMode, Spectrum};
pub use session::{ButtonStatus, ConnectionStatus, DeviceHandle};
