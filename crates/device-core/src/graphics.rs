//! Display connection and rendering-context contract.
//!
//! The capture and encoder devices both bind to a rendering context, and
//! that context may only be used from the thread that made it current.

use nvcap_common::error::NvcapResult;

use crate::handle::{DisplayHandle, FbConfig, FrameSize, GlContext, GlPixmap, Pixmap};

/// Capabilities a framebuffer configuration must offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbConfigRequest {
    /// Usable as a pixmap drawable.
    pub pixmap_drawable: bool,
    /// Usable as a window drawable.
    pub window_drawable: bool,
    /// Can bind an RGBA texture from a drawable.
    pub bind_to_texture_rgba: bool,
    /// Supports 2D texture targets when binding.
    pub texture_2d: bool,
}

impl FbConfigRequest {
    /// What the capture path needs: pixmap + window drawables with RGBA
    /// 2D texture binding.
    pub const TEXTURE_CAPTURE: Self = Self {
        pixmap_drawable: true,
        window_drawable: true,
        bind_to_texture_rgba: true,
        texture_2d: true,
    };
}

/// An opened display and the geometry of its default screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    pub handle: DisplayHandle,
    pub screen: FrameSize,
    /// Bit depth of the default screen, used for drawable creation.
    pub depth: u32,
}

/// The context/config pair both devices bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlBinding {
    pub context: GlContext,
    pub fb_config: FbConfig,
}

/// Display server and rendering-context operations.
///
/// Release operations are infallible from the caller's point of view;
/// implementations log whatever the underlying API reports.
pub trait GraphicsApi {
    /// Open a display connection. `None` selects the default display.
    fn open_display(&mut self, name: Option<&str>) -> NvcapResult<DisplayInfo>;

    fn close_display(&mut self, display: DisplayHandle);

    /// Framebuffer configurations matching `request`, best first. An empty
    /// list is reported as an error.
    fn choose_fb_configs(
        &mut self,
        display: DisplayHandle,
        request: &FbConfigRequest,
    ) -> NvcapResult<Vec<FbConfig>>;

    fn create_context(&mut self, display: DisplayHandle, config: FbConfig)
        -> NvcapResult<GlContext>;

    fn destroy_context(&mut self, display: DisplayHandle, context: GlContext);

    fn create_pixmap(
        &mut self,
        display: DisplayHandle,
        size: FrameSize,
        depth: u32,
    ) -> NvcapResult<Pixmap>;

    fn free_pixmap(&mut self, display: DisplayHandle, pixmap: Pixmap);

    fn create_gl_pixmap(
        &mut self,
        display: DisplayHandle,
        config: FbConfig,
        pixmap: Pixmap,
    ) -> NvcapResult<GlPixmap>;

    fn destroy_gl_pixmap(&mut self, display: DisplayHandle, pixmap: GlPixmap);

    /// Make `target` current on the calling thread, or release the current
    /// context with `None`.
    fn make_current(
        &mut self,
        display: DisplayHandle,
        target: Option<(GlPixmap, GlContext)>,
    ) -> NvcapResult<()>;
}
