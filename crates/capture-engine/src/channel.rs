//! Request/reply handoff between a handle and its worker.
//!
//! Two single-slot channels: one carries a [`Call`] to the worker, the
//! other carries its result back. `submit` takes `&mut self`, so a handle
//! can never have a second call in flight.

use crossbeam::channel::{bounded, Receiver, Sender};

use nvcap_common::error::{NvcapError, NvcapResult};

use crate::context::OpenCall;
use crate::frame::Frame;
use crate::pipeline::CaptureRequest;
use crate::session::SessionInfo;

pub(crate) enum Call {
    Open(OpenCall),
    Capture(CaptureRequest),
    Close,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Capture(_) => "capture",
            Self::Close => "close",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Reply {
    Opened(SessionInfo),
    Captured {
        frame: Frame,
        /// Present when the call rebuilt the session.
        session: Option<SessionInfo>,
    },
    Closed,
}

/// Caller side.
pub(crate) struct CallChannel {
    requests: Sender<Call>,
    replies: Receiver<NvcapResult<Reply>>,
}

/// Worker side.
pub(crate) struct WorkerEnd {
    pub requests: Receiver<Call>,
    pub replies: Sender<NvcapResult<Reply>>,
}

pub(crate) fn call_channel() -> (CallChannel, WorkerEnd) {
    let (request_tx, request_rx) = bounded(1);
    let (reply_tx, reply_rx) = bounded(1);
    (
        CallChannel {
            requests: request_tx,
            replies: reply_rx,
        },
        WorkerEnd {
            requests: request_rx,
            replies: reply_tx,
        },
    )
}

impl CallChannel {
    /// Hand `call` to the worker and block until it replies.
    pub fn submit(&mut self, call: Call) -> NvcapResult<Reply> {
        self.requests
            .send(call)
            .map_err(|_| NvcapError::WorkerGone)?;
        self.replies.recv().map_err(|_| NvcapError::WorkerGone)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_returns_worker_reply() {
        let (mut channel, end) = call_channel();
        let worker = std::thread::spawn(move || {
            let call = end.requests.recv().unwrap();
            assert_eq!(call.name(), "close");
            end.replies.send(Ok(Reply::Closed)).unwrap();
        });

        assert!(matches!(channel.submit(Call::Close), Ok(Reply::Closed)));
        worker.join().unwrap();
    }

    #[test]
    fn vanished_worker_is_reported() {
        let (mut channel, end) = call_channel();
        drop(end);
        assert!(matches!(channel.submit(Call::Close), Err(NvcapError::WorkerGone)));
    }

    #[test]
    fn worker_dropping_reply_side_is_reported() {
        let (mut channel, end) = call_channel();
        let worker = std::thread::spawn(move || {
            let _ = end.requests.recv();
            drop(end);
        });
        assert!(matches!(channel.submit(Call::Close), Err(NvcapError::WorkerGone)));
        worker.join().unwrap();
    }
}
