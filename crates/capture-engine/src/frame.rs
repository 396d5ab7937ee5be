//! Encoded frames handed back to callers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque reference to whatever owns a context on the caller side
/// (a pipeline element, a session object). Frames keep it alive.
pub type ParentRef = Arc<dyn Any + Send + Sync>;

/// One encoded access unit.
///
/// The payload is a copy of the encoder output; the device buffer it came
/// from has already been unlocked. Dropping the frame releases the payload
/// and the parent reference.
pub struct Frame {
    data: Vec<u8>,
    /// Aligned frame width from the encode parameters.
    pub width: u32,
    pub height: u32,
    /// Whether a decoder can start at this frame.
    pub keyframe: bool,
    pub frame_index: u64,
    /// `frame_index * duration_ns`.
    pub timestamp_ns: u64,
    pub duration_ns: u64,
    /// Opaque caller timestamp, passed through untouched.
    pub timestamp_hint: i64,
    context_id: u64,
    parent: Option<ParentRef>,
}

/// Everything a frame is built from except its owner.
pub(crate) struct FrameParts {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub keyframe: bool,
    pub frame_index: u64,
    pub timestamp_ns: u64,
    pub duration_ns: u64,
    pub timestamp_hint: i64,
}

impl Frame {
    pub(crate) fn new(parts: FrameParts, context_id: u64, parent: Option<ParentRef>) -> Self {
        Self {
            data: parts.data,
            width: parts.width,
            height: parts.height,
            keyframe: parts.keyframe,
            frame_index: parts.frame_index,
            timestamp_ns: parts.timestamp_ns,
            duration_ns: parts.duration_ns,
            timestamp_hint: parts.timestamp_hint,
            context_id,
            parent,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Id of the context that produced this frame.
    pub fn owner_context(&self) -> u64 {
        self.context_id
    }

    pub fn parent(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    /// Take the payload, dropping the parent reference.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Wrap the payload as a GStreamer buffer stamped with this frame's
    /// timing. Non-keyframes are flagged as delta units.
    #[cfg(feature = "gstreamer")]
    pub fn into_gst_buffer(self) -> gstreamer::Buffer {
        use gstreamer as gst;

        let pts = gst::ClockTime::from_nseconds(self.timestamp_ns);
        let duration = gst::ClockTime::from_nseconds(self.duration_ns);
        let keyframe = self.keyframe;

        let mut buffer = gst::Buffer::from_mut_slice(self.data);
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(pts);
            buffer.set_duration(duration);
            if !keyframe {
                buffer.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }
        buffer
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("size", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("keyframe", &self.keyframe)
            .field("frame_index", &self.frame_index)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("context_id", &self.context_id)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
