//! Screen capture device contract.

use nvcap_common::error::NvcapResult;

use crate::config::BufferFormat;
use crate::graphics::GlBinding;
use crate::handle::{CaptureHandle, FrameSize};

/// Number of texture slots a capture session can expose.
pub const MAX_TEXTURES: usize = 2;

/// Device state reported before a session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStatus {
    /// Native screen geometry, unaligned.
    pub screen_size: FrameSize,
    /// Whether a capture session can be created right now.
    pub can_create_now: bool,
}

/// What part of the desktop a session follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingType {
    /// The whole X screen.
    #[default]
    Screen,
    /// A single output, by device-specific id.
    Output(u32),
}

/// Parameters for creating a capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSessionParams {
    pub frame_size: FrameSize,
    pub with_cursor: bool,
    pub tracking: TrackingType,
    /// Device signals frame availability instead of being sampled.
    pub push_model: bool,
    pub allow_direct_capture: bool,
    /// Report mode changes as must-recreate instead of recovering silently.
    pub disable_auto_modeset_recovery: bool,
    /// Sampling interval; ignored by the device in push mode.
    pub sampling_rate_ms: u32,
}

/// Textures the session renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureSetup {
    /// Texture names; a zero marks the end of the populated slots.
    pub textures: [u32; MAX_TEXTURES],
    /// Texture target the names are bound to.
    pub target: u32,
}

impl TextureSetup {
    /// Populated slots in order, stopping at the first empty one.
    pub fn populated(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.textures
            .iter()
            .copied()
            .enumerate()
            .take_while(|(_, texture)| *texture != 0)
    }
}

/// Grab behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GrabFlags {
    /// Return immediately instead of waiting for a new frame.
    pub no_wait: bool,
    /// Re-render even when nothing changed on screen.
    pub force_refresh: bool,
    /// Return immediately only when a new frame is already ready.
    pub no_wait_if_new_frame_ready: bool,
}

impl GrabFlags {
    /// Non-blocking grab with forced refresh that prefers a ready frame.
    pub const LOW_LATENCY: Self = Self {
        no_wait: true,
        force_refresh: true,
        no_wait_if_new_frame_ready: true,
    };
}

/// Result of a successful grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrabInfo {
    /// Slot in [`TextureSetup::textures`] that holds the frame.
    pub texture_index: usize,
    pub width: u32,
    pub height: u32,
    /// Whether the device bypassed composition for this frame.
    pub direct_capture: bool,
    pub is_new_frame: bool,
}

/// Capture device operations.
///
/// `grab` reports a stale session as [`NvcapError::MustRecreate`];
/// every other error is final for the call.
///
/// [`NvcapError::MustRecreate`]: nvcap_common::error::NvcapError::MustRecreate
pub trait CaptureApi {
    /// Create a handle bound to an externally managed rendering context.
    fn create_handle(&mut self, binding: GlBinding) -> NvcapResult<CaptureHandle>;

    fn status(&mut self, handle: CaptureHandle) -> NvcapResult<CaptureStatus>;

    fn create_session(
        &mut self,
        handle: CaptureHandle,
        params: &CaptureSessionParams,
    ) -> NvcapResult<()>;

    /// Route session output into rendering-context textures.
    fn setup_gl(&mut self, handle: CaptureHandle, format: BufferFormat)
        -> NvcapResult<TextureSetup>;

    fn grab(&mut self, handle: CaptureHandle, flags: GrabFlags) -> NvcapResult<GrabInfo>;

    fn destroy_session(&mut self, handle: CaptureHandle) -> NvcapResult<()>;

    fn destroy_handle(&mut self, handle: CaptureHandle) -> NvcapResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populated_stops_at_first_empty_slot() {
        let setup = TextureSetup {
            textures: [7, 0],
            target: 0x0DE1,
        };
        assert_eq!(setup.populated().collect::<Vec<_>>(), vec![(0, 7)]);

        let empty = TextureSetup::default();
        assert_eq!(empty.populated().count(), 0);
    }
}
