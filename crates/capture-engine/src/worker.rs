//! The affinity worker: one thread per context, one call at a time.
//!
//! The worker owns the [`PinnedContext`] for its whole life. It processes
//! a call, posts the reply, and only then waits for the next call. A
//! failed open or a close ends the thread after its reply is posted; a
//! dropped handle ends it too, releasing the context on the way out.

use std::sync::Arc;
use std::thread::JoinHandle;

use nvcap_common::error::{NvcapError, NvcapResult};
use nvcap_device_core::DeviceFactory;

use crate::channel::{call_channel, Call, CallChannel, Reply, WorkerEnd};
use crate::context::PinnedContext;
use crate::stats::WorkerStats;

pub(crate) struct AffinityWorker {
    id: u64,
    factory: Arc<dyn DeviceFactory>,
    stats: Arc<WorkerStats>,
    end: WorkerEnd,
}

/// Start the worker thread for context `id`.
pub(crate) fn spawn(
    id: u64,
    factory: Arc<dyn DeviceFactory>,
    stats: Arc<WorkerStats>,
) -> NvcapResult<(CallChannel, JoinHandle<()>)> {
    let (channel, end) = call_channel();
    let worker = AffinityWorker {
        id,
        factory,
        stats,
        end,
    };
    let thread = std::thread::Builder::new()
        .name(format!("nvcap-worker-{id}"))
        .spawn(move || worker.run())?;
    Ok((channel, thread))
}

impl AffinityWorker {
    fn run(self) {
        let span = tracing::info_span!("worker", context = self.id, backend = self.factory.name());
        let _entered = span.enter();
        tracing::debug!("Worker started");

        let mut context: Option<PinnedContext> = None;
        while let Ok(call) = self.end.requests.recv() {
            let name = call.name();
            self.stats.begin_call();
            let (reply, terminate) = self.process(call, &mut context);
            self.stats.end_call();

            if let Err(e) = &reply {
                tracing::debug!(call = name, error = %e, "Call failed");
            }
            if self.end.replies.send(reply).is_err() {
                tracing::warn!(call = name, "Caller went away before the reply");
                break;
            }
            if terminate {
                break;
            }
        }

        // A dropped handle leaves the context behind; release it here.
        if let Some(context) = context.take() {
            if let Err(e) = context.close() {
                tracing::warn!(error = %e, "Context release at worker exit failed");
            }
        }
        tracing::debug!("Worker exiting");
    }

    /// Run one call. The flag is true when the worker must exit after
    /// replying.
    fn process(
        &self,
        call: Call,
        context: &mut Option<PinnedContext>,
    ) -> (NvcapResult<Reply>, bool) {
        match call {
            Call::Open(open) => {
                if context.is_some() {
                    return (
                        Err(NvcapError::invalid_params("context is already open")),
                        false,
                    );
                }
                match PinnedContext::open(
                    self.id,
                    Arc::clone(&self.factory),
                    &open,
                    Arc::clone(&self.stats),
                ) {
                    Ok((opened, info)) => {
                        tracing::info!(size = %info.size, gop = info.gop_length, "Context opened");
                        *context = Some(opened);
                        (Ok(Reply::Opened(info)), false)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Open failed");
                        (Err(e), true)
                    }
                }
            }
            Call::Capture(request) => match context.as_mut() {
                Some(context) => {
                    let reply = context
                        .capture(&request)
                        .map(|(frame, session)| Reply::Captured { frame, session });
                    (reply, false)
                }
                None => (Err(NvcapError::Closed), false),
            },
            Call::Close => {
                let result = match context.take() {
                    Some(context) => context.close(),
                    None => Ok(()),
                };
                (result.map(|()| Reply::Closed), true)
            }
        }
    }
}
