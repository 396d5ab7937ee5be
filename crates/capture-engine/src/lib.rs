//! nvcap Capture Engine
//!
//! Grabs the screen into GPU textures and encodes each grab to one H.264
//! access unit. The capture and encoder devices are bound to a rendering
//! context that may only be used from the thread that made it current, so
//! every device call for a context runs on one dedicated worker thread.
//!
//! # Architecture
//!
//! ```text
//!  caller thread(s)              worker thread (one per context)
//! ┌───────────────┐   Call    ┌──────────────────────────────────────┐
//! │ ContextHandle │ ────────▶ │ AffinityWorker                       │
//! │  open         │           │  ┌────────────────────────────────┐  │
//! │  capture      │ ◀──────── │  │ PinnedContext                  │  │
//! │  close        │   Reply   │  │  surface: display, context,    │  │
//! └───────────────┘           │  │           pixmap, current      │  │
//!        │                    │  │  SessionManager: capture +     │  │
//!        ▼                    │  │           encoder sessions     │  │
//!      Frame                  │  │  FramePipeline: grab → map →   │  │
//!                             │  │   encode → copy → unmap        │  │
//!                             │  └────────────────────────────────┘  │
//!                             └──────────────────────────────────────┘
//! ```
//!
//! Devices are supplied through [`nvcap_device_core::DeviceFactory`]; the
//! factory is moved to the worker and instantiates every API object there.

mod channel;
mod context;
pub mod dispatcher;
mod dump;
pub mod frame;
pub mod pipeline;
pub mod session;
pub mod stats;
mod worker;

pub use dispatcher::{ContextHandle, OpenOptions};
pub use frame::{Frame, ParentRef};
pub use pipeline::{CaptureRequest, GRAB_ATTEMPTS};
pub use session::{gop_length_for, SessionInfo, SessionParams};
pub use stats::StatsSnapshot;
