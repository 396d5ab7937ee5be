use std::sync::Arc;

use nvcap_capture_engine::{CaptureRequest, ContextHandle, OpenOptions, SessionParams, GRAB_ATTEMPTS};
use nvcap_common::error::NvcapError;
use nvcap_device_core::FrameSize;
use nvcap_device_sim::{SimDevices, SimOp};

fn params() -> SessionParams {
    SessionParams::new(30, 1, 2_000_000)
}

fn open(devices: &SimDevices) -> ContextHandle {
    ContextHandle::open(Arc::new(devices.clone()), OpenOptions::default()).unwrap()
}

#[test]
fn one_stale_grab_rebuilds_and_succeeds() {
    let devices = SimDevices::default();
    let mut handle = open(&devices);
    devices.push_must_recreate(1);

    let frame = handle.capture(CaptureRequest::new(params(), 0)).unwrap();
    assert!(frame.keyframe);
    assert_eq!(frame.width, 1920);

    let report = devices.report();
    assert_eq!(report.count(SimOp::Grab), 2);
    assert_eq!(report.count(SimOp::CreateCaptureSession), 2);
    assert_eq!(handle.stats().session_builds, 2);
    handle.close().unwrap();
}

#[test]
fn two_stale_grabs_still_succeed_on_last_attempt() {
    let devices = SimDevices::default();
    let mut handle = open(&devices);
    devices.push_must_recreate(2);

    handle.capture(CaptureRequest::new(params(), 0)).unwrap();
    assert_eq!(devices.report().count(SimOp::Grab), 3);
    handle.close().unwrap();
}

#[test]
fn persistent_staleness_gives_up_after_three_grabs() {
    let devices = SimDevices::default();
    let mut handle = open(&devices);
    devices.push_must_recreate(3);

    let err = handle.capture(CaptureRequest::new(params(), 0)).unwrap_err();
    assert!(matches!(err, NvcapError::RetriesExhausted { attempts: 3 }));
    assert_eq!(GRAB_ATTEMPTS, 3);

    let report = devices.report();
    assert_eq!(report.count(SimOp::Grab), 3);
    // Open, then a rebuild after each of the first two stale grabs.
    assert_eq!(report.count(SimOp::CreateCaptureSession), 3);
    assert_eq!(report.count(SimOp::EncodePicture), 0);

    // Not fatal for the context.
    handle.capture(CaptureRequest::new(params(), 1)).unwrap();
    handle.close().unwrap();
    assert!(devices.report().is_clean());
}

#[test]
fn screen_mode_change_is_followed() {
    let devices = SimDevices::with_screen(1920, 1080);
    let mut handle = open(&devices);
    handle.capture(CaptureRequest::new(params(), 0)).unwrap();

    devices.set_screen(FrameSize::new(1366, 768));
    let frame = handle.capture(CaptureRequest::new(params(), 1)).unwrap();
    assert_eq!((frame.width, frame.height), (1368, 768));
    assert!(frame.keyframe);
    assert_eq!(handle.session_info().size, FrameSize::new(1368, 768));
    handle.close().unwrap();
}

#[test]
fn failed_rebuild_poisons_until_close() {
    let devices = SimDevices::default();
    let mut handle = open(&devices);
    handle.capture(CaptureRequest::new(params(), 0)).unwrap();

    devices.fail_next(SimOp::OpenEncodeSession, 5);
    let changed = SessionParams::new(60, 1, 2_000_000);
    let err = handle.capture(CaptureRequest::new(changed, 1)).unwrap_err();
    assert!(matches!(err, NvcapError::Rebuild { .. }), "{err}");

    let err = handle.capture(CaptureRequest::new(changed, 2)).unwrap_err();
    assert!(matches!(err, NvcapError::ContextPoisoned));

    let calls = devices.report().count(SimOp::Grab);
    assert_eq!(calls, 1);

    handle.close().unwrap();
    assert!(devices.report().is_clean());
}

#[test]
fn failed_rebuild_during_retry_poisons() {
    let devices = SimDevices::default();
    let mut handle = open(&devices);
    devices.push_must_recreate(1);
    devices.fail_next(SimOp::CreateCaptureSession, 6);

    let err = handle.capture(CaptureRequest::new(params(), 0)).unwrap_err();
    assert!(matches!(err, NvcapError::Rebuild { .. }));
    assert!(matches!(
        handle.capture(CaptureRequest::new(params(), 1)),
        Err(NvcapError::ContextPoisoned)
    ));
    handle.close().unwrap();
    assert!(devices.report().is_clean());
}

#[test]
fn non_stale_grab_failure_is_not_retried() {
    let devices = SimDevices::default();
    let mut handle = open(&devices);
    devices.fail_next(SimOp::Grab, 4);

    let err = handle.capture(CaptureRequest::new(params(), 0)).unwrap_err();
    assert!(matches!(err, NvcapError::Device { op: "grab", status: 4 }));
    let report = devices.report();
    assert_eq!(report.count(SimOp::Grab), 1);
    assert_eq!(report.count(SimOp::CreateCaptureSession), 1);

    handle.capture(CaptureRequest::new(params(), 1)).unwrap();
    handle.close().unwrap();
}
