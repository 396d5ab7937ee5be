//! Per-call frame production: grab, map, encode, copy out.
//!
//! ```text
//! params changed? ──yes──▶ rebuild ──fail──▶ poisoned
//!        │ no                 │
//!        ▼                    ▼
//!      grab ──must recreate (attempt 1, 2)──▶ rebuild ──▶ grab
//!        │ ok                     (attempt 3) ──▶ RetriesExhausted
//!        ▼
//!   map ─▶ encode ─▶ lock/copy/unlock ─▶ unmap ─▶ Frame
//! ```

use std::time::Instant;

use nvcap_common::clock::{frame_timestamp_ns, IntervalTracker};
use nvcap_common::error::{NvcapError, NvcapResult};
use nvcap_device_core::GrabInfo;

use crate::dump::BitstreamDump;
use crate::frame::{Frame, FrameParts, ParentRef};
use crate::session::{SessionManager, SessionParams};

/// Grab attempts per capture call, counting the first.
pub const GRAB_ATTEMPTS: u32 = 3;

/// One capture call's arguments.
#[derive(Clone)]
pub struct CaptureRequest {
    /// Attached to the frame; the context's parent is used when unset.
    pub parent: Option<ParentRef>,
    pub params: SessionParams,
    /// Force an IDR picture. Does not rebuild the session.
    pub force_keyframe: bool,
    /// Caller's monotonically increasing frame counter.
    pub frame_index: u64,
    /// Passed through to the frame untouched.
    pub timestamp_hint: i64,
}

impl CaptureRequest {
    pub fn new(params: SessionParams, frame_index: u64) -> Self {
        Self {
            parent: None,
            params,
            force_keyframe: false,
            frame_index,
            timestamp_hint: 0,
        }
    }

    pub fn with_force_keyframe(mut self, force: bool) -> Self {
        self.force_keyframe = force;
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_timestamp_hint(mut self, hint: i64) -> Self {
        self.timestamp_hint = hint;
        self
    }
}

impl std::fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRequest")
            .field("params", &self.params)
            .field("force_keyframe", &self.force_keyframe)
            .field("frame_index", &self.frame_index)
            .field("timestamp_hint", &self.timestamp_hint)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

pub(crate) struct FramePipeline {
    context_id: u64,
    parent: Option<ParentRef>,
    poisoned: bool,
    intervals: IntervalTracker,
    dump: Option<BitstreamDump>,
}

impl FramePipeline {
    pub fn new(context_id: u64, parent: Option<ParentRef>, dump: Option<BitstreamDump>) -> Self {
        Self {
            context_id,
            parent,
            poisoned: false,
            intervals: IntervalTracker::new(),
            dump,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn capture_frame(
        &mut self,
        session: &mut SessionManager,
        request: &CaptureRequest,
    ) -> NvcapResult<Frame> {
        if self.poisoned {
            return Err(NvcapError::ContextPoisoned);
        }
        request.params.validate()?;

        if session.params() != request.params {
            tracing::info!(
                from = ?session.params(),
                to = ?request.params,
                "Session parameters changed"
            );
            self.rebuild(session, request.params)?;
        }

        if session.has_outstanding() {
            if let Err(e) = session.release_outstanding() {
                self.poisoned = true;
                tracing::error!(error = %e, "Leftover encoder lock or mapping cannot be released; context must be closed");
                return Err(e);
            }
        }

        let grab = self.grab_with_retry(session, request.params)?;
        tracing::debug!(
            direct_capture = grab.direct_capture,
            width = grab.width,
            height = grab.height,
            slot = grab.texture_index,
            "Grabbed frame"
        );

        let duration_ns = request.params.frame_duration_ns();
        let timestamp_ns = frame_timestamp_ns(request.frame_index, duration_ns);
        if let Some(sample) = self.intervals.record(Instant::now(), duration_ns) {
            tracing::debug!(
                expected_us = sample.expected_us,
                real_us = sample.real_us,
                lag_us = sample.lag_us(),
                "Capture interval"
            );
        }

        let mapped = session.map_slot(grab.texture_index)?;
        let encoded = session
            .pic_params(
                mapped,
                request.frame_index,
                duration_ns,
                timestamp_ns,
                request.force_keyframe,
            )
            .and_then(|pic| {
                session.encode(&pic)?;
                let picture = session.fetch_output()?;
                Ok((pic, picture))
            });
        // Unmap even when the encode failed; report the first failure.
        let unmapped = session.unmap(mapped.resource);
        let (pic, picture) = encoded?;
        unmapped?;

        if let Some(dump) = self.dump.as_mut() {
            dump.append(&picture.data);
        }

        let keyframe = picture.picture_type.is_keyframe();
        tracing::trace!(
            frame_index = request.frame_index,
            bytes = picture.data.len(),
            keyframe,
            "Encoded frame"
        );

        let parent = request.parent.clone().or_else(|| self.parent.clone());
        Ok(Frame::new(
            FrameParts {
                data: picture.data,
                width: pic.width,
                height: pic.height,
                keyframe,
                frame_index: request.frame_index,
                timestamp_ns,
                duration_ns,
                timestamp_hint: request.timestamp_hint,
            },
            self.context_id,
            parent,
        ))
    }

    /// Grab, rebuilding after a stale-session report, at most
    /// [`GRAB_ATTEMPTS`] times.
    fn grab_with_retry(
        &mut self,
        session: &mut SessionManager,
        params: SessionParams,
    ) -> NvcapResult<GrabInfo> {
        for attempt in 1..=GRAB_ATTEMPTS {
            match session.grab() {
                Ok(grab) => return Ok(grab),
                Err(e) if e.is_must_recreate() && attempt < GRAB_ATTEMPTS => {
                    tracing::info!(attempt, "Capture session went stale, rebuilding");
                    self.rebuild(session, params)?;
                }
                Err(e) if e.is_must_recreate() => break,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Grab failed");
                    return Err(e);
                }
            }
        }
        tracing::error!(attempts = GRAB_ATTEMPTS, "Capture session still stale");
        Err(NvcapError::RetriesExhausted {
            attempts: GRAB_ATTEMPTS,
        })
    }

    fn rebuild(&mut self, session: &mut SessionManager, params: SessionParams) -> NvcapResult<()> {
        self.intervals.reset();
        match session.rebuild(params) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.poisoned = true;
                tracing::error!(error = %e, "Rebuild failed; context must be closed");
                Err(NvcapError::rebuild(e.to_string()))
            }
        }
    }
}
