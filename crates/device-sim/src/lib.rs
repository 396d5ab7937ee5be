//! Simulated display, capture, and encoder devices.
//!
//! [`SimDevices`] implements [`DeviceFactory`] over one shared, lockable
//! state. Every API object it hands out records its calls there, so a test
//! can drive the capture engine and then inspect exactly what the devices
//! saw: call counts and order, calling threads, session and encoder
//! parameters, and any object left alive.
//!
//! The devices are strict about ordering. Mapping an unregistered
//! resource, destroying an encoder with live resources, or locking a buffer
//! that was never encoded into fails with [`STATUS_INVALID_CALL`].

mod bitstream;
mod capture;
mod encoder;
mod graphics;
mod state;

pub use bitstream::synthesize_picture;
pub use state::{Resource, SimOp, SimReport, STATUS_INVALID_CALL};

use std::sync::{Arc, Mutex, MutexGuard};

use nvcap_common::error::NvcapResult;
use nvcap_device_core::{CaptureApi, DeviceFactory, EncoderApi, FrameSize, GraphicsApi};

use crate::state::SimState;

/// Shape of the simulated machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Native screen geometry, unaligned.
    pub screen: FrameSize,
    pub depth: u32,
    /// Texture slots a capture session populates (at most two).
    pub textures: usize,
    /// Whether grabs report direct capture.
    pub direct_capture: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            screen: FrameSize::new(1920, 1080),
            depth: 24,
            textures: 2,
            direct_capture: false,
        }
    }
}

/// Factory for simulated devices sharing one observable state.
#[derive(Debug, Clone)]
pub struct SimDevices {
    state: Arc<Mutex<SimState>>,
}

impl SimDevices {
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    pub fn with_screen(width: u32, height: u32) -> Self {
        Self::new(SimConfig {
            screen: FrameSize::new(width, height),
            ..SimConfig::default()
        })
    }

    /// Fail the next call to `op` with `status`. Repeated calls queue up.
    pub fn fail_next(&self, op: SimOp, status: i32) {
        self.lock().fail_next(op, status);
    }

    /// Fail every call to `op` with `status` until [`Self::clear_faults`].
    pub fn fail_always(&self, op: SimOp, status: i32) {
        self.lock().fail_always(op, status);
    }

    pub fn clear_faults(&self) {
        self.lock().clear_faults();
    }

    /// Make the next `count` grabs report a stale session.
    pub fn push_must_recreate(&self, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.grab_script.push_back(true);
        }
    }

    /// Change the screen geometry. Sessions created for the old geometry
    /// report must-recreate on every grab.
    pub fn set_screen(&self, screen: FrameSize) {
        self.lock().config.screen = screen;
    }

    pub fn report(&self) -> SimReport {
        self.lock().report()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        lock_state(&self.state)
    }
}

impl Default for SimDevices {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl DeviceFactory for SimDevices {
    fn name(&self) -> &str {
        "sim"
    }

    fn graphics(&self) -> NvcapResult<Box<dyn GraphicsApi>> {
        Ok(Box::new(graphics::SimGraphics::new(Arc::clone(&self.state))))
    }

    fn capture(&self) -> NvcapResult<Box<dyn CaptureApi>> {
        lock_state(&self.state).enter(SimOp::CreateCaptureInstance)?;
        Ok(Box::new(capture::SimCapture::new(Arc::clone(&self.state))))
    }

    fn encoder(&self) -> NvcapResult<Box<dyn EncoderApi>> {
        lock_state(&self.state).enter(SimOp::CreateEncoderInstance)?;
        Ok(Box::new(encoder::SimEncoder::new(Arc::clone(&self.state))))
    }
}

/// A panic in one test thread must not hide what the devices recorded.
pub(crate) fn lock_state(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
