//! Single-pass scans: recognition policies and flash capture.

mod common;

use common::{calibrate, open_rig, Rig};
use spectro_daq::hardware::{Pass, Strip};
use spectro_daq::measurement::ReferenceColorSpace;
use spectro_daq::options::keys;
use spectro_daq::scan::reference::ReferenceLine;
use spectro_daq::{MeasurementMode, SpectroError, Spectrum};

async fn scan_rig(strip: &Strip, recognition: &str) -> Rig {
    let rig = open_rig().await;
    rig.device.set_strip(strip.clone());
    rig.engine
        .set_option(rig.handle, keys::RECOGNITION, recognition)
        .await
        .unwrap();
    calibrate(&rig, MeasurementMode::ReflectanceScan).await;
    rig
}

/// Lab values of `patches`, flattened the way a chart line is passed in.
fn lab_line<'a>(patches: impl Iterator<Item = &'a Spectrum>) -> Vec<f64> {
    let template = ReferenceLine::new(ReferenceColorSpace::Lab, vec![0.0; 3], 1).unwrap();
    patches.flat_map(|p| template.express(p)).collect()
}

async fn assert_patches(rig: &Rig, expected: &[Spectrum]) {
    assert_eq!(
        rig.engine.sample_count(rig.handle).await.unwrap(),
        expected.len()
    );
    for (i, patch) in expected.iter().enumerate() {
        let measured = rig.engine.spectrum(rig.handle, i).await.unwrap();
        assert!(measured.rms_distance(patch) < 1e-6, "patch {}", i);
    }
}

#[tokio::test]
async fn test_correlation_restores_chart_order() {
    let strip = Strip::test_chart(5, 8.0);
    let rig = scan_rig(&strip, "RecognitionCorrelation").await;
    rig.engine
        .set_reference_line(rig.handle, lab_line(strip.patches.iter()), 5)
        .await
        .unwrap();
    rig.device.queue_pass(Pass::over(&strip).reversed());

    rig.engine.trigger(rig.handle).await.unwrap();
    assert_patches(&rig, &strip.patches).await;
    assert_eq!(
        rig.engine
            .get_option(rig.handle, keys::LAST_SCAN_DIRECTION)
            .await
            .unwrap(),
        "-1"
    );

    // The line is used up by the scan.
    rig.device.queue_pass(Pass::over(&strip));
    assert_eq!(
        rig.engine.trigger(rig.handle).await,
        Err(SpectroError::NoReferenceChartLine)
    );
}

#[tokio::test]
async fn test_correlation_failure_reports_recognized_patches() {
    let strip = Strip::test_chart(5, 8.0);
    let rig = scan_rig(&strip, "RecognitionCorrelation").await;
    rig.engine
        .set_reference_line(rig.handle, lab_line(strip.patches[..3].iter()), 3)
        .await
        .unwrap();
    rig.device.queue_pass(Pass::over(&strip));

    assert_eq!(
        rig.engine.trigger(rig.handle).await,
        Err(SpectroError::ChartCorrelationFailed { recognized: 5 })
    );
    assert_eq!(
        rig.engine
            .get_option(rig.handle, keys::RECOGNIZED_PATCHES)
            .await
            .unwrap(),
        "5"
    );
    assert_eq!(rig.engine.sample_count(rig.handle).await.unwrap(), 0);
}

#[tokio::test]
async fn test_position_recognition_splits_ruler_travel() {
    let strip = Strip::test_chart(6, 8.0);
    let rig = scan_rig(&strip, "RecognitionPosition").await;
    rig.engine
        .set_option(rig.handle, keys::PATCHES_PER_LINE, "6")
        .await
        .unwrap();
    rig.device.queue_pass(Pass::over(&strip));

    rig.engine.trigger(rig.handle).await.unwrap();
    assert_patches(&rig, &strip.patches).await;
}

#[tokio::test]
async fn test_position_recognition_needs_six_patches() {
    let strip = Strip::test_chart(4, 8.0);
    let rig = scan_rig(&strip, "RecognitionPosition").await;
    rig.engine
        .set_option(rig.handle, keys::PATCHES_PER_LINE, "4")
        .await
        .unwrap();
    let io = rig.device.io_count();

    assert!(matches!(
        rig.engine.trigger(rig.handle).await,
        Err(SpectroError::InvalidArgument(_))
    ));
    assert_eq!(rig.device.io_count(), io);
}

#[tokio::test]
async fn test_flash_recognition_is_ambient_only() {
    let strip = Strip::test_chart(4, 8.0);
    let rig = scan_rig(&strip, "RecognitionFlash").await;
    assert!(matches!(
        rig.engine.trigger(rig.handle).await,
        Err(SpectroError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_ambient_scan_reports_each_flash() {
    let rig = open_rig().await;
    calibrate(&rig, MeasurementMode::AmbientLightScan).await;
    let flashes = vec![Spectrum::flat(0.05), Spectrum::flat(0.1), Spectrum::flat(0.2)];
    rig.device.queue_flashes(flashes.clone());

    rig.engine.trigger(rig.handle).await.unwrap();
    assert_patches(&rig, &flashes).await;
    assert_eq!(
        rig.engine
            .get_option(rig.handle, keys::AVAILABLE_RESULT_INDEXES)
            .await
            .unwrap(),
        "Emissive"
    );
    assert_eq!(
        rig.engine
            .get_option(rig.handle, keys::RECOGNIZED_PATCHES)
            .await
            .unwrap(),
        "3"
    );
}

#[tokio::test]
async fn test_ambient_scan_without_flash_fails() {
    let rig = open_rig().await;
    calibrate(&rig, MeasurementMode::AmbientLightScan).await;
    rig.device.queue_flashes(Vec::new());
    assert_eq!(
        rig.engine.trigger(rig.handle).await,
        Err(SpectroError::StripRecognitionFailed)
    );
}
