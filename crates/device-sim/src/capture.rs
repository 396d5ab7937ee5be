use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nvcap_common::error::{NvcapError, NvcapResult};
use nvcap_device_core::{
    BufferFormat, CaptureApi, CaptureHandle, CaptureSessionParams, CaptureStatus, FrameSize,
    GlBinding, GrabFlags, GrabInfo, TextureSetup, MAX_TEXTURES, WIDTH_ALIGNMENT,
};

use crate::lock_state;
use crate::state::{Resource, SimOp, SimState};

/// GL_TEXTURE_2D.
const TEXTURE_TARGET_2D: u32 = 0x0DE1;

struct SimSession {
    frame_size: FrameSize,
    textures: Option<TextureSetup>,
    next_slot: usize,
}

pub(crate) struct SimCapture {
    state: Arc<Mutex<SimState>>,
    handles: HashMap<u64, Option<SimSession>>,
}

impl SimCapture {
    pub fn new(state: Arc<Mutex<SimState>>) -> Self {
        Self {
            state,
            handles: HashMap::new(),
        }
    }
}

impl CaptureApi for SimCapture {
    fn create_handle(&mut self, binding: GlBinding) -> NvcapResult<CaptureHandle> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::CreateCaptureHandle)?;
        if !state.is_live(Resource::Context, binding.context.0) {
            return Err(state.invalid(SimOp::CreateCaptureHandle));
        }
        let id = state.acquire(Resource::CaptureHandle);
        self.handles.insert(id, None);
        Ok(CaptureHandle(id))
    }

    fn status(&mut self, handle: CaptureHandle) -> NvcapResult<CaptureStatus> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::CaptureStatus)?;
        if !self.handles.contains_key(&handle.0) {
            return Err(state.invalid(SimOp::CaptureStatus));
        }
        Ok(CaptureStatus {
            screen_size: state.screen(),
            can_create_now: true,
        })
    }

    fn create_session(
        &mut self,
        handle: CaptureHandle,
        params: &CaptureSessionParams,
    ) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::CreateCaptureSession)?;
        let Some(slot) = self.handles.get_mut(&handle.0) else {
            return Err(state.invalid(SimOp::CreateCaptureSession));
        };
        if slot.is_some()
            || params.frame_size.is_empty()
            || params.frame_size.width % WIDTH_ALIGNMENT != 0
        {
            return Err(state.invalid(SimOp::CreateCaptureSession));
        }
        state.session_params.push(params.clone());
        state.acquire_id(Resource::CaptureSession, handle.0);
        *slot = Some(SimSession {
            frame_size: params.frame_size,
            textures: None,
            next_slot: 0,
        });
        Ok(())
    }

    fn setup_gl(&mut self, handle: CaptureHandle, _format: BufferFormat) -> NvcapResult<TextureSetup> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::SetupGl)?;
        let Some(Some(session)) = self.handles.get_mut(&handle.0) else {
            return Err(state.invalid(SimOp::SetupGl));
        };
        let count = state.config.textures.min(MAX_TEXTURES);
        let mut setup = TextureSetup {
            textures: [0; MAX_TEXTURES],
            target: TEXTURE_TARGET_2D,
        };
        for (slot, texture) in setup.textures.iter_mut().take(count).enumerate() {
            // Texture names are unique per handle.
            *texture = (handle.0 as u32) * 16 + slot as u32 + 1;
        }
        session.textures = Some(setup);
        Ok(setup)
    }

    fn grab(&mut self, handle: CaptureHandle, _flags: GrabFlags) -> NvcapResult<GrabInfo> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::Grab)?;
        let screen = state.screen().aligned();
        let direct_capture = state.config.direct_capture;
        let scripted_stale = state.grab_script.pop_front().unwrap_or(false);

        let Some(Some(session)) = self.handles.get_mut(&handle.0) else {
            return Err(state.invalid(SimOp::Grab));
        };
        let Some(setup) = session.textures else {
            return Err(state.invalid(SimOp::Grab));
        };
        if scripted_stale || session.frame_size != screen {
            return Err(NvcapError::MustRecreate);
        }

        let populated = setup.populated().count().max(1);
        let texture_index = session.next_slot % populated;
        session.next_slot = session.next_slot.wrapping_add(1);
        Ok(GrabInfo {
            texture_index,
            width: session.frame_size.width,
            height: session.frame_size.height,
            direct_capture,
            is_new_frame: true,
        })
    }

    fn destroy_session(&mut self, handle: CaptureHandle) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::DestroyCaptureSession)?;
        match self.handles.get_mut(&handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                state.release(Resource::CaptureSession, handle.0);
                Ok(())
            }
            _ => Err(state.invalid(SimOp::DestroyCaptureSession)),
        }
    }

    fn destroy_handle(&mut self, handle: CaptureHandle) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::DestroyCaptureHandle)?;
        match self.handles.remove(&handle.0) {
            Some(session) => {
                // Destroying a handle implicitly ends its session.
                if session.is_some() {
                    state.release(Resource::CaptureSession, handle.0);
                }
                state.release(Resource::CaptureHandle, handle.0);
                Ok(())
            }
            None => Err(state.invalid(SimOp::DestroyCaptureHandle)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimDevices;
    use nvcap_device_core::{DeviceFactory, FbConfig, GlContext, TrackingType};

    fn params(size: FrameSize) -> CaptureSessionParams {
        CaptureSessionParams {
            frame_size: size,
            with_cursor: false,
            tracking: TrackingType::Screen,
            push_model: true,
            allow_direct_capture: true,
            disable_auto_modeset_recovery: true,
            sampling_rate_ms: 33,
        }
    }

    fn binding(devices: &SimDevices) -> GlBinding {
        let mut state = lock_state(&devices.state);
        GlBinding {
            context: GlContext(state.acquire(Resource::Context)),
            fb_config: FbConfig(0x21),
        }
    }

    #[test]
    fn grab_rotates_through_populated_textures() {
        let devices = SimDevices::default();
        let mut capture = devices.capture().unwrap();
        let handle = capture.create_handle(binding(&devices)).unwrap();
        capture.create_session(handle, &params(FrameSize::new(1920, 1080))).unwrap();
        let setup = capture.setup_gl(handle, BufferFormat::Nv12).unwrap();
        assert_eq!(setup.populated().count(), 2);

        let first = capture.grab(handle, GrabFlags::LOW_LATENCY).unwrap();
        let second = capture.grab(handle, GrabFlags::LOW_LATENCY).unwrap();
        let third = capture.grab(handle, GrabFlags::LOW_LATENCY).unwrap();
        assert_eq!((first.texture_index, second.texture_index, third.texture_index), (0, 1, 0));
        assert_eq!(first.width, 1920);
    }

    #[test]
    fn screen_change_makes_session_stale() {
        let devices = SimDevices::with_screen(1366, 768);
        let mut capture = devices.capture().unwrap();
        let handle = capture.create_handle(binding(&devices)).unwrap();
        capture.create_session(handle, &params(FrameSize::new(1368, 768))).unwrap();
        capture.setup_gl(handle, BufferFormat::Nv12).unwrap();
        assert!(capture.grab(handle, GrabFlags::LOW_LATENCY).is_ok());

        devices.set_screen(FrameSize::new(1280, 720));
        let err = capture.grab(handle, GrabFlags::LOW_LATENCY).unwrap_err();
        assert!(err.is_must_recreate());
    }

    #[test]
    fn unaligned_session_width_is_rejected() {
        let devices = SimDevices::with_screen(1366, 768);
        let mut capture = devices.capture().unwrap();
        let handle = capture.create_handle(binding(&devices)).unwrap();
        let err = capture
            .create_session(handle, &params(FrameSize::new(1366, 768)))
            .unwrap_err();
        assert!(matches!(err, NvcapError::Device { op: "create_capture_session", .. }));
    }

    #[test]
    fn scripted_stale_grabs_are_consumed_in_order() {
        let devices = SimDevices::default();
        devices.push_must_recreate(1);
        let mut capture = devices.capture().unwrap();
        let handle = capture.create_handle(binding(&devices)).unwrap();
        capture.create_session(handle, &params(FrameSize::new(1920, 1080))).unwrap();
        capture.setup_gl(handle, BufferFormat::Nv12).unwrap();

        assert!(capture.grab(handle, GrabFlags::LOW_LATENCY).unwrap_err().is_must_recreate());
        assert!(capture.grab(handle, GrabFlags::LOW_LATENCY).is_ok());
    }
}
