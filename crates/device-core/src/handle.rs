//! Opaque device handles and frame geometry.
//!
//! Handles are plain identifiers minted by a device implementation. They
//! carry no ownership: whoever created one is responsible for releasing it
//! through the same API object, on the same thread.

use serde::{Deserialize, Serialize};

macro_rules! device_handle {
    ($($(#[$meta:meta])* $name:ident;)+) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub u64);
        )+
    };
}

device_handle! {
    /// Connection to a display server.
    DisplayHandle;
    /// A framebuffer configuration usable for texture binding.
    FbConfig;
    /// Rendering context.
    GlContext;
    /// Off-screen drawable.
    Pixmap;
    /// Drawable bound into the rendering context.
    GlPixmap;
    /// Capture device handle.
    CaptureHandle;
    /// Encoder session.
    EncoderHandle;
    /// A texture registered as encoder input.
    RegisteredResource;
    /// A registered resource mapped for one encode.
    MappedResource;
    /// Encoder output buffer.
    BitstreamBuffer;
}

/// Alignment the capture device requires for frame width.
pub const WIDTH_ALIGNMENT: u32 = 4;

/// Round a width up to the next multiple of [`WIDTH_ALIGNMENT`].
pub fn align_width(width: u32) -> u32 {
    width.saturating_add(WIDTH_ALIGNMENT - 1) & !(WIDTH_ALIGNMENT - 1)
}

/// Frame geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Same height, width rounded up to the device alignment.
    pub fn aligned(self) -> Self {
        Self {
            width: align_width(self.width),
            height: self.height,
        }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for FrameSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
