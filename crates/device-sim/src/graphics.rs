use std::sync::{Arc, Mutex};

use nvcap_common::error::{NvcapError, NvcapResult};
use nvcap_device_core::{
    DisplayHandle, DisplayInfo, FbConfig, FbConfigRequest, FrameSize, GlContext, GlPixmap,
    GraphicsApi, Pixmap,
};

use crate::lock_state;
use crate::state::{Resource, SimOp, SimState};

/// Framebuffer config ids the simulated display offers, best first.
const FB_CONFIGS: [u64; 2] = [0x21, 0x22];

pub(crate) struct SimGraphics {
    state: Arc<Mutex<SimState>>,
    current: Option<u64>,
}

impl SimGraphics {
    pub fn new(state: Arc<Mutex<SimState>>) -> Self {
        Self {
            state,
            current: None,
        }
    }

    fn release(&self, op: SimOp, kind: Resource, id: u64) {
        let mut state = lock_state(&self.state);
        if let Err(e) = state.enter(op) {
            tracing::debug!("Ignoring injected release fault: {e}");
        }
        if !state.release(kind, id) {
            tracing::warn!(op = op.name(), id, "Release of unknown handle");
        }
    }
}

impl GraphicsApi for SimGraphics {
    fn open_display(&mut self, name: Option<&str>) -> NvcapResult<DisplayInfo> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::OpenDisplay)?;
        if name.is_some_and(|name| !name.starts_with(':')) {
            return Err(NvcapError::display(format!(
                "cannot open display {}",
                name.unwrap_or_default()
            )));
        }
        let id = state.acquire(Resource::Display);
        Ok(DisplayInfo {
            handle: DisplayHandle(id),
            screen: state.screen(),
            depth: state.config.depth,
        })
    }

    fn close_display(&mut self, display: DisplayHandle) {
        self.release(SimOp::CloseDisplay, Resource::Display, display.0);
    }

    fn choose_fb_configs(
        &mut self,
        display: DisplayHandle,
        request: &FbConfigRequest,
    ) -> NvcapResult<Vec<FbConfig>> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::ChooseFbConfigs)?;
        if !state.is_live(Resource::Display, display.0) {
            return Err(state.invalid(SimOp::ChooseFbConfigs));
        }
        if !request.bind_to_texture_rgba {
            return Err(NvcapError::display("no framebuffer config without RGBA texture binding"));
        }
        Ok(FB_CONFIGS.iter().copied().map(FbConfig).collect())
    }

    fn create_context(&mut self, display: DisplayHandle, config: FbConfig) -> NvcapResult<GlContext> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::CreateContext)?;
        if !state.is_live(Resource::Display, display.0) || !FB_CONFIGS.contains(&config.0) {
            return Err(state.invalid(SimOp::CreateContext));
        }
        Ok(GlContext(state.acquire(Resource::Context)))
    }

    fn destroy_context(&mut self, _display: DisplayHandle, context: GlContext) {
        if self.current == Some(context.0) {
            tracing::warn!(context = context.0, "Destroying the current context");
        }
        self.release(SimOp::DestroyContext, Resource::Context, context.0);
    }

    fn create_pixmap(
        &mut self,
        display: DisplayHandle,
        size: FrameSize,
        depth: u32,
    ) -> NvcapResult<Pixmap> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::CreatePixmap)?;
        if !state.is_live(Resource::Display, display.0) || size.is_empty() || depth == 0 {
            return Err(state.invalid(SimOp::CreatePixmap));
        }
        Ok(Pixmap(state.acquire(Resource::Pixmap)))
    }

    fn free_pixmap(&mut self, _display: DisplayHandle, pixmap: Pixmap) {
        self.release(SimOp::FreePixmap, Resource::Pixmap, pixmap.0);
    }

    fn create_gl_pixmap(
        &mut self,
        display: DisplayHandle,
        _config: FbConfig,
        pixmap: Pixmap,
    ) -> NvcapResult<GlPixmap> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::CreateGlPixmap)?;
        if !state.is_live(Resource::Display, display.0) || !state.is_live(Resource::Pixmap, pixmap.0)
        {
            return Err(state.invalid(SimOp::CreateGlPixmap));
        }
        Ok(GlPixmap(state.acquire(Resource::GlPixmap)))
    }

    fn destroy_gl_pixmap(&mut self, _display: DisplayHandle, pixmap: GlPixmap) {
        self.release(SimOp::DestroyGlPixmap, Resource::GlPixmap, pixmap.0);
    }

    fn make_current(
        &mut self,
        _display: DisplayHandle,
        target: Option<(GlPixmap, GlContext)>,
    ) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        match target {
            Some((drawable, context)) => {
                state.enter(SimOp::MakeCurrent)?;
                if !state.is_live(Resource::GlPixmap, drawable.0)
                    || !state.is_live(Resource::Context, context.0)
                {
                    return Err(state.invalid(SimOp::MakeCurrent));
                }
                if let Some(previous) = self.current.replace(context.0) {
                    state.release(Resource::Current, previous);
                }
                state.acquire_id(Resource::Current, context.0);
            }
            None => {
                state.enter(SimOp::ReleaseCurrent)?;
                if let Some(previous) = self.current.take() {
                    state.release(Resource::Current, previous);
                }
            }
        }
        Ok(())
    }
}
