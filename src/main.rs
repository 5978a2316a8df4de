//! Spectro DAQ demo CLI
//!
//! Drives a simulated instrument through the engine and prints the results
//! as JSON on stdout. Logs go to stderr.
//!
//! # Commands
//!
//! - `info`: capabilities and option values of the instrument
//! - `spot`: calibrate and take one spot measurement
//! - `scan`: calibrate and scan a simulated test strip
//! - `dual-scan`: forward and backward pass over a fluorescent strip

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use spectro_daq::config::SpectroConfig;
use spectro_daq::hardware::{Pass, SimulatedBus, SimulatedInstrument, Strip};
use spectro_daq::logging::{self, LoggingConfig};
use spectro_daq::measurement::{Densities, ScanDirection, Tristimulus};
use spectro_daq::options::{keys, split_values};
use spectro_daq::{DeviceEvent, DeviceHandle, Instrument, MeasurementMode, Spectrum};

/// Demo driver for the spectrophotometer engine
#[derive(Parser)]
#[command(name = "spectro_daq")]
#[command(version)]
#[command(about = "Measure with a simulated spectrophotometer")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/spectro.toml")]
    config: PathBuf,

    /// Serial number of the simulated instrument
    #[arg(long, default_value = "1000001")]
    serial: String,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print capabilities and option values
    Info,
    /// One spot measurement
    Spot {
        /// Spot mode (ReflectanceSpot, EmissionSpot, AmbientLightSpot, DualReflectanceSpot)
        #[arg(long, default_value = "ReflectanceSpot")]
        mode: MeasurementMode,
        /// Patch of the test chart placed under the aperture
        #[arg(long, default_value_t = 0)]
        patch: usize,
    },
    /// Single-pass scan over a test strip
    Scan {
        /// Patches on the strip
        #[arg(long, default_value_t = 8)]
        patches: usize,
        /// Patch width in millimetres
        #[arg(long, default_value_t = 8.0)]
        width: f64,
        /// Recognition policy
        #[arg(long, default_value = "RecognitionBasic")]
        recognition: String,
    },
    /// Dual scan: forward tungsten pass, backward UV pass
    DualScan {
        /// Patches on the strip
        #[arg(long, default_value_t = 8)]
        patches: usize,
        /// Patch width in millimetres
        #[arg(long, default_value_t = 8.0)]
        width: f64,
        /// Optical brightener strength of the paper
        #[arg(long, default_value_t = 0.05)]
        fluorescence: f64,
    },
}

#[derive(Serialize)]
struct PatchReport {
    index: usize,
    condition: String,
    spectrum: Spectrum,
    tristimulus: Tristimulus,
    densities: Option<Densities>,
}

#[derive(Serialize)]
struct MeasurementReport {
    serial: String,
    mode: MeasurementMode,
    recognized_patches: String,
    last_scan_direction: String,
    results: Vec<PatchReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SpectroConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let logging_config = match cli.verbose {
        0 => LoggingConfig::from_config(&config).map_err(anyhow::Error::msg)?,
        1 => LoggingConfig::new(tracing::Level::DEBUG),
        _ => LoggingConfig::new(tracing::Level::TRACE),
    };
    logging::init(logging_config.with_ansi(false)).map_err(anyhow::Error::msg)?;

    let bus = Arc::new(SimulatedBus::new());
    let device = Arc::new(SimulatedInstrument::new(&cli.serial));
    bus.attach(Arc::clone(&device));

    let engine = Instrument::new(bus, config);
    engine.register_handler(
        Some(Arc::new(|event: &DeviceEvent| {
            info!(handle = %event.handle, event = %event.kind, "device event");
        })),
        None,
    );

    let handle = *engine
        .get_devices()
        .await?
        .first()
        .context("no instrument attached")?;
    engine.open(handle).await.context("opening instrument")?;

    let output = match cli.command {
        Commands::Info => info_report(&engine, handle).await?,
        Commands::Spot { mode, patch } => {
            device.set_reflectance(spectro_daq::hardware::mock::patch_reflectance(patch));
            device.set_emission(Spectrum::flat(0.02));
            engine.set_mode(handle, mode).await?;
            engine.calibrate(handle).await.context("calibration")?;
            engine.trigger(handle).await.context("measurement")?;
            serde_json::to_value(collect(&engine, handle, &cli.serial).await?)?
        }
        Commands::Scan {
            patches,
            width,
            recognition,
        } => {
            let strip = Strip::test_chart(patches, width);
            device.set_strip(strip.clone());
            device.queue_pass(Pass::over(&strip));
            engine
                .set_mode(handle, MeasurementMode::ReflectanceScan)
                .await?;
            engine
                .set_option(handle, keys::RECOGNITION, &recognition)
                .await?;
            engine
                .set_option(handle, keys::PATCHES_PER_LINE, &patches.to_string())
                .await?;
            engine.calibrate(handle).await.context("calibration")?;
            engine.trigger(handle).await.context("scan")?;
            serde_json::to_value(collect(&engine, handle, &cli.serial).await?)?
        }
        Commands::DualScan {
            patches,
            width,
            fluorescence,
        } => {
            let strip = Strip::test_chart(patches, width).with_fluorescence(fluorescence);
            device.set_strip(strip.clone());
            device.queue_pass(Pass::over(&strip));
            device.queue_pass(Pass::over(&strip).reversed());
            engine
                .set_mode(handle, MeasurementMode::DualReflectanceScan)
                .await?;
            engine.calibrate(handle).await.context("calibration")?;

            engine
                .set_option(handle, keys::SCAN_DIRECTION, ScanDirection::Forward.as_str())
                .await?;
            engine.trigger(handle).await.context("forward pass")?;
            engine
                .set_option(handle, keys::SCAN_DIRECTION, ScanDirection::Backward.as_str())
                .await?;
            engine.trigger(handle).await.context("backward pass")?;
            serde_json::to_value(collect(&engine, handle, &cli.serial).await?)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    engine.close(handle).await?;
    Ok(())
}

async fn info_report(engine: &Instrument, handle: DeviceHandle) -> Result<serde_json::Value> {
    let capabilities = engine.capabilities(handle)?;
    let mut options = serde_json::Map::new();
    for key in [
        keys::DEVICE_TYPE,
        keys::AVAILABLE_MEASUREMENT_MODES,
        keys::AVAILABLE_RECOGNITIONS,
        keys::MEASUREMENT_MODE,
        keys::RECOGNITION,
        keys::ADAPTIVE_MEASUREMENT,
        keys::PRECISION_CALIBRATION,
        keys::TIME_SINCE_CALIBRATION,
    ] {
        let value = engine.get_option(handle, key).await?;
        options.insert(key.to_string(), serde_json::Value::String(value));
    }
    Ok(serde_json::json!({
        "sdk_version": engine.get_global_option(keys::SDK_VERSION)?,
        "capabilities": capabilities,
        "options": options,
    }))
}

async fn collect(
    engine: &Instrument,
    handle: DeviceHandle,
    serial: &str,
) -> Result<MeasurementReport> {
    let mut results = Vec::new();
    let available = engine
        .get_option(handle, keys::AVAILABLE_RESULT_INDEXES)
        .await?;
    for condition in split_values(&available) {
        engine
            .set_option(handle, keys::RESULT_INDEX, condition)
            .await?;
        for index in 0..engine.sample_count(handle).await? {
            results.push(PatchReport {
                index,
                condition: condition.to_string(),
                spectrum: engine.spectrum(handle, index).await?,
                tristimulus: engine.tristimulus(handle, index).await?,
                densities: engine.densities(handle, index).await.ok(),
            });
        }
    }

    Ok(MeasurementReport {
        serial: serial.to_string(),
        mode: engine.mode(handle).await?,
        recognized_patches: engine
            .get_option(handle, keys::RECOGNIZED_PATCHES)
            .await?,
        last_scan_direction: engine
            .get_option(handle, keys::LAST_SCAN_DIRECTION)
            .await?,
        results,
    })
}
