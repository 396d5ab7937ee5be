//! The thread-pinned context: rendering surface, session, frame pipeline.
//!
//! A [`PinnedContext`] is created, used, and dropped on the worker thread.
//! It is neither `Send` nor `Sync`, so nothing can move it elsewhere.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use nvcap_common::config::SessionDefaults;
use nvcap_common::error::{NvcapError, NvcapResult};
use nvcap_device_core::{
    DeviceFactory, DisplayInfo, FbConfig, FbConfigRequest, FrameSize, GlBinding, GlContext,
    GlPixmap, GraphicsApi, Pixmap,
};

use crate::dump::BitstreamDump;
use crate::frame::{Frame, ParentRef};
use crate::pipeline::{CaptureRequest, FramePipeline};
use crate::session::{SessionInfo, SessionManager, SessionParams};
use crate::stats::WorkerStats;

/// Arguments of an open call.
#[derive(Clone)]
pub(crate) struct OpenCall {
    pub display_name: Option<String>,
    pub defaults: SessionDefaults,
    pub dump_path: Option<PathBuf>,
    pub parent: Option<ParentRef>,
}

/// Display objects the capture and encoder sessions bind to.
///
/// Fields are filled in acquisition order and released in reverse.
#[derive(Debug, Default)]
struct GlSurface {
    display: Option<DisplayInfo>,
    fb_config: Option<FbConfig>,
    context: Option<GlContext>,
    pixmap: Option<Pixmap>,
    gl_pixmap: Option<GlPixmap>,
    current: bool,
}

impl GlSurface {
    fn acquire(gl: &mut dyn GraphicsApi, display_name: Option<&str>) -> NvcapResult<Self> {
        let mut guard = SurfaceGuard {
            gl,
            surface: GlSurface::default(),
        };
        guard.acquire_steps(display_name)?;
        Ok(guard.disarm())
    }

    fn binding(&self) -> Option<GlBinding> {
        Some(GlBinding {
            context: self.context?,
            fb_config: self.fb_config?,
        })
    }

    fn release(&mut self, gl: &mut dyn GraphicsApi) {
        let Some(display) = self.display.take() else {
            return;
        };
        let handle = display.handle;
        if std::mem::take(&mut self.current) {
            if let Err(e) = gl.make_current(handle, None) {
                tracing::warn!(error = %e, "Failed to release current context");
            }
        }
        if let Some(gl_pixmap) = self.gl_pixmap.take() {
            gl.destroy_gl_pixmap(handle, gl_pixmap);
        }
        if let Some(pixmap) = self.pixmap.take() {
            gl.free_pixmap(handle, pixmap);
        }
        if let Some(context) = self.context.take() {
            gl.destroy_context(handle, context);
        }
        self.fb_config = None;
        gl.close_display(handle);
        tracing::debug!("Rendering surface released");
    }
}

/// Releases a partially acquired surface unless disarmed.
struct SurfaceGuard<'a> {
    gl: &'a mut dyn GraphicsApi,
    surface: GlSurface,
}

impl SurfaceGuard<'_> {
    fn acquire_steps(&mut self, display_name: Option<&str>) -> NvcapResult<()> {
        let opened = self.gl.open_display(display_name)?;
        self.surface.display = Some(opened);
        let handle = opened.handle;

        let fb_config = self
            .gl
            .choose_fb_configs(handle, &FbConfigRequest::TEXTURE_CAPTURE)?
            .into_iter()
            .next()
            .ok_or_else(|| NvcapError::display("no framebuffer config supports texture capture"))?;
        self.surface.fb_config = Some(fb_config);

        let context = self.gl.create_context(handle, fb_config)?;
        self.surface.context = Some(context);

        let pixmap = self
            .gl
            .create_pixmap(handle, FrameSize::new(1, 1), opened.depth)?;
        self.surface.pixmap = Some(pixmap);

        let gl_pixmap = self.gl.create_gl_pixmap(handle, fb_config, pixmap)?;
        self.surface.gl_pixmap = Some(gl_pixmap);

        self.gl.make_current(handle, Some((gl_pixmap, context)))?;
        self.surface.current = true;

        tracing::debug!(screen = %opened.screen, depth = opened.depth, "Rendering context current");
        Ok(())
    }

    fn disarm(mut self) -> GlSurface {
        std::mem::take(&mut self.surface)
    }
}

impl Drop for SurfaceGuard<'_> {
    fn drop(&mut self) {
        self.surface.release(&mut *self.gl);
    }
}

pub(crate) struct PinnedContext {
    id: u64,
    pipeline: FramePipeline,
    session: SessionManager,
    surface: GlSurface,
    gl: Box<dyn GraphicsApi>,
    _pinned: PhantomData<*const ()>,
}

impl PinnedContext {
    /// Acquire the rendering surface and build the first session.
    ///
    /// On failure everything acquired so far has been released.
    pub fn open(
        id: u64,
        factory: Arc<dyn DeviceFactory>,
        call: &OpenCall,
        stats: Arc<WorkerStats>,
    ) -> NvcapResult<(Self, SessionInfo)> {
        let params = SessionParams::from(&call.defaults);
        params.validate()?;

        let mut gl = factory.graphics()?;
        let surface = GlSurface::acquire(gl.as_mut(), call.display_name.as_deref())?;
        let binding = surface
            .binding()
            .ok_or_else(|| NvcapError::display("rendering surface incomplete"))?;

        let session = SessionManager::new(factory, stats, binding, params, call.defaults.gop_length);
        let dump = BitstreamDump::open_optional(call.dump_path.as_deref());
        let mut context = Self {
            id,
            pipeline: FramePipeline::new(id, call.parent.clone(), dump),
            session,
            surface,
            gl,
            _pinned: PhantomData,
        };

        // Dropping `context` on failure releases the surface.
        let info = context.session.build(params)?;
        Ok((context, info))
    }

    pub fn capture(&mut self, request: &CaptureRequest) -> NvcapResult<(Frame, Option<SessionInfo>)> {
        let generation = self.session.generation();
        let frame = self.pipeline.capture_frame(&mut self.session, request)?;
        let rebuilt = (self.session.generation() != generation)
            .then(|| self.session.info())
            .flatten();
        Ok((frame, rebuilt))
    }

    /// Tear down the session, then the surface.
    pub fn close(mut self) -> NvcapResult<()> {
        tracing::info!(context = self.id, poisoned = self.pipeline.is_poisoned(), "Closing context");
        self.release()
    }

    fn release(&mut self) -> NvcapResult<()> {
        let result = self.session.teardown();
        self.surface.release(self.gl.as_mut());
        result
    }
}

impl Drop for PinnedContext {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(context = self.id, error = %e, "Context release on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvcap_device_sim::{SimDevices, SimOp};

    fn call() -> OpenCall {
        OpenCall {
            display_name: None,
            defaults: SessionDefaults::default(),
            dump_path: None,
            parent: None,
        }
    }

    fn open(devices: &SimDevices) -> NvcapResult<(PinnedContext, SessionInfo)> {
        PinnedContext::open(1, Arc::new(devices.clone()), &call(), Arc::new(WorkerStats::default()))
    }

    #[test]
    fn open_acquires_in_order_and_close_releases_everything() {
        let devices = SimDevices::default();
        let (context, info) = open(&devices).unwrap();
        assert_eq!(info.size, FrameSize::new(1920, 1080));
        assert_eq!(info.gop_length, 30);

        let report = devices.report();
        assert!(report.in_order(&[
            SimOp::OpenDisplay,
            SimOp::ChooseFbConfigs,
            SimOp::CreateContext,
            SimOp::CreatePixmap,
            SimOp::CreateGlPixmap,
            SimOp::MakeCurrent,
            SimOp::CreateCaptureHandle,
            SimOp::CreateBitstreamBuffer,
        ]));

        context.close().unwrap();
        let report = devices.report();
        assert!(report.is_clean(), "leaked: {:?}", report.live);
        assert!(report.in_order(&[
            SimOp::DestroyCaptureHandle,
            SimOp::ReleaseCurrent,
            SimOp::DestroyGlPixmap,
            SimOp::FreePixmap,
            SimOp::DestroyContext,
            SimOp::CloseDisplay,
        ]));
    }

    #[test]
    fn failure_at_every_open_step_unwinds() {
        let steps = [
            SimOp::OpenDisplay,
            SimOp::ChooseFbConfigs,
            SimOp::CreateContext,
            SimOp::CreatePixmap,
            SimOp::CreateGlPixmap,
            SimOp::MakeCurrent,
            SimOp::CreateCaptureInstance,
            SimOp::CreateCaptureHandle,
            SimOp::CaptureStatus,
            SimOp::CreateCaptureSession,
            SimOp::SetupGl,
            SimOp::CreateEncoderInstance,
            SimOp::OpenEncodeSession,
            SimOp::PresetConfig,
            SimOp::InitializeEncoder,
            SimOp::RegisterResource,
            SimOp::CreateBitstreamBuffer,
        ];
        for step in steps {
            let devices = SimDevices::default();
            devices.fail_next(step, 7);
            let err = open(&devices).err().expect("open should fail");
            assert!(
                matches!(err, NvcapError::Device { status: 7, .. }),
                "{step:?}: {err}"
            );
            let report = devices.report();
            assert!(report.is_clean(), "{step:?} leaked {:?}", report.live);
        }
    }

    #[test]
    fn zero_default_frame_rate_fails_before_any_device_call() {
        let devices = SimDevices::default();
        let mut call = call();
        call.defaults.fps_d = 0;
        let result =
            PinnedContext::open(1, Arc::new(devices.clone()), &call, Arc::new(WorkerStats::default()));
        assert!(matches!(result, Err(NvcapError::InvalidParams { .. })));
        assert!(devices.report().log.is_empty());
    }

    #[test]
    fn drop_releases_like_close() {
        let devices = SimDevices::default();
        let (context, _) = open(&devices).unwrap();
        drop(context);
        assert!(devices.report().is_clean());
    }
}
