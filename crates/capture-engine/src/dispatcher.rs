//! Public handle: open, capture, release, close.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use nvcap_common::config::{NvcapConfig, SessionDefaults};
use nvcap_common::error::{NvcapError, NvcapResult};
use nvcap_device_core::DeviceFactory;

use crate::channel::{Call, CallChannel, Reply};
use crate::context::OpenCall;
use crate::frame::{Frame, ParentRef};
use crate::pipeline::CaptureRequest;
use crate::session::SessionInfo;
use crate::stats::{StatsSnapshot, WorkerStats};
use crate::worker;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// How to open a context.
#[derive(Clone, Default)]
pub struct OpenOptions {
    /// Display to capture. `None` selects the primary display.
    pub display_name: Option<String>,
    /// Session parameters until the first capture overrides them.
    pub defaults: SessionDefaults,
    /// Append every encoded frame to this file.
    pub dump_path: Option<PathBuf>,
    /// Attached to frames whose request carries no parent of its own.
    pub parent: Option<ParentRef>,
}

impl OpenOptions {
    pub fn from_config(config: &NvcapConfig) -> Self {
        Self {
            display_name: config.display.clone(),
            defaults: config.session.clone(),
            dump_path: config.dump.path.clone(),
            parent: None,
        }
    }

    pub fn with_display(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_dump_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = Some(path.into());
        self
    }
}

/// Handle to an open capture context.
///
/// Every operation runs on the context's worker thread; this handle only
/// submits calls and waits. Methods that talk to the worker take
/// `&mut self`, so calls on one handle never overlap. Share a handle
/// across threads behind a `Mutex`.
pub struct ContextHandle {
    id: u64,
    channel: Option<CallChannel>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
    session: SessionInfo,
}

impl ContextHandle {
    /// Start a worker and open a context on it.
    ///
    /// On failure the worker has already released whatever it acquired
    /// and exited.
    pub fn open(factory: Arc<dyn DeviceFactory>, options: OpenOptions) -> NvcapResult<Self> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(WorkerStats::default());
        tracing::info!(
            context = id,
            backend = factory.name(),
            display = options.display_name.as_deref().unwrap_or("default"),
            "Opening context"
        );

        let (mut channel, thread) = worker::spawn(id, factory, Arc::clone(&stats))?;
        let call = Call::Open(OpenCall {
            display_name: options.display_name,
            defaults: options.defaults,
            dump_path: options.dump_path,
            parent: options.parent,
        });

        match channel.submit(call) {
            Ok(Reply::Opened(session)) => Ok(Self {
                id,
                channel: Some(channel),
                worker: Some(thread),
                stats,
                session,
            }),
            Ok(other) => {
                drop(channel);
                join_worker(id, thread);
                Err(unexpected(other))
            }
            Err(e) => {
                drop(channel);
                join_worker(id, thread);
                Err(e)
            }
        }
    }

    /// Produce one encoded frame.
    pub fn capture(&mut self, request: CaptureRequest) -> NvcapResult<Frame> {
        let channel = self.channel.as_mut().ok_or(NvcapError::Closed)?;
        match channel.submit(Call::Capture(request))? {
            Reply::Captured { frame, session } => {
                if let Some(session) = session {
                    self.session = session;
                }
                Ok(frame)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Give a frame back. Releases its payload and parent reference.
    pub fn release_frame(&self, frame: Frame) {
        if frame.owner_context() != self.id {
            tracing::warn!(
                context = self.id,
                owner = frame.owner_context(),
                "Releasing a frame produced by another context"
            );
        }
        drop(frame);
    }

    /// Tear down the session and display objects and stop the worker.
    ///
    /// Safe to call more than once; later calls do nothing. Every other
    /// operation fails with [`NvcapError::Closed`] afterwards.
    pub fn close(&mut self) -> NvcapResult<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        tracing::info!(context = self.id, "Closing context");
        let result = channel.submit(Call::Close);
        drop(channel);
        if let Some(thread) = self.worker.take() {
            join_worker(self.id, thread);
        }
        match result? {
            Reply::Closed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_none()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The most recently built session.
    pub fn session_info(&self) -> &SessionInfo {
        &self.session
    }

    /// Worker counters; never blocks on the worker.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(context = self.id, error = %e, "Close on drop failed");
        }
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("session", &self.session)
            .finish()
    }
}

fn join_worker(id: u64, thread: JoinHandle<()>) {
    if thread.join().is_err() {
        tracing::error!(context = id, "Worker thread panicked");
    }
}

fn unexpected(reply: Reply) -> NvcapError {
    NvcapError::Other(anyhow::anyhow!("unexpected worker reply: {reply:?}"))
}
