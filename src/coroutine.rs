//! The per-endpoint suspendable read coroutine.
//!
//! Realized as a dedicated OS thread rendezvousing with the reactor thread
//! over a pair of channels, rather than a hand-rolled parser state machine
//! or a nightly generator. Exactly one side is ever runnable: the reactor
//! thread blocks on `request_rx` the instant it resumes a coroutine, and
//! the coroutine thread blocks on `resume_rx` the instant [`Context::read`]
//! needs bytes it doesn't have yet. Every other [`Context`] operation —
//! write, seek, close, lookups, timer scheduling — is *also* a blocking
//! round trip over the same channels, answered immediately by the reactor
//! thread without giving control back to the readiness loop: this is what
//! lets the coroutine thread hold the handler (behind an uncontended
//! `Mutex`, never touched by the reactor thread while a coroutine runs)
//! without the two threads ever touching endpoint state concurrently.
use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel as chan;
use log::error;

use crate::facade::{ChannelInner, Context, Request, Resume};
use crate::handler::{Handler, Tag};

/// Render a caught panic payload as a loggable string. Handler code panics
/// with either a `&'static str` (`panic!("literal")`) or a `String`
/// (`panic!("{}", x)`) in the overwhelming majority of cases; anything else
/// is reported generically rather than guessed at.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

/// Which handler callback a freshly spawned coroutine thread should run.
pub(crate) enum Job<T> {
    ClientInit(T),
    ServerInit(T, SocketAddr, u16),
    RecvData(T),
}

/// The reactor-side handle to a live coroutine thread.
pub(crate) struct Coroutine<T: Tag> {
    handle: Option<JoinHandle<()>>,
    pub(crate) resume_tx: chan::Sender<Resume<T>>,
    pub(crate) request_rx: chan::Receiver<Request<T>>,
    /// `false` once a `Done` has been observed; the endpoint gets a fresh
    /// coroutine (not this one reused) the next time it becomes readable.
    pub(crate) alive: bool,
}

impl<T: Tag> Coroutine<T> {
    /// Spawn a new coroutine thread running `job` against `handler`.
    pub(crate) fn spawn<H>(handler: Arc<Mutex<H>>, job: Job<T>) -> Self
    where
        H: Handler<Tag = T> + 'static,
    {
        let (resume_tx, resume_rx) = chan::bounded::<Resume<T>>(0);
        let (request_tx, request_rx) = chan::bounded::<Request<T>>(0);

        let thread_request_tx = request_tx;
        let thread_resume_rx = resume_rx;

        let handle = std::thread::Builder::new()
            .name("reactor-coroutine".into())
            .spawn(move || {
                let inner = ChannelInner::new(thread_request_tx.clone(), thread_resume_rx);
                let mut ctx = Context::channel(inner);
                // A previous callback elsewhere may have panicked while holding this
                // lock and poisoned it; recovering the inner guard rather than
                // `.expect`ing here is what keeps one handler panic from taking down
                // every other endpoint's coroutine thread along with it.
                let mut guard = handler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| match job {
                    Job::ClientInit(tag) => guard.client_init(&mut ctx, tag),
                    Job::ServerInit(listener_tag, addr, port) => {
                        guard.server_init(&mut ctx, listener_tag, addr, port)
                    }
                    Job::RecvData(tag) => guard.recv_data(&mut ctx, tag),
                }));
                drop(guard);

                match outcome {
                    Ok(()) => {
                        thread_request_tx.send(Request::Done).ok();
                    }
                    Err(payload) => {
                        let detail = panic_message(&*payload);
                        error!("handler callback panicked: {}", detail);
                        thread_request_tx.send(Request::Panicked(detail)).ok();
                    }
                }
            })
            .expect("failed to spawn reactor coroutine thread");

        Self {
            handle: Some(handle),
            resume_tx,
            request_rx,
            alive: true,
        }
    }

    /// Resume the coroutine by handing it newly read bytes, unblocking
    /// whatever `Need` it last parked on.
    pub(crate) fn feed(&self, data: Vec<u8>) {
        self.resume_tx.send(Resume::Data(data)).ok();
    }

    /// Reply to a non-`Need` request so the coroutine thread keeps running
    /// without returning control to the event loop.
    pub(crate) fn ack(&self, resume: Resume<T>) {
        self.resume_tx.send(resume).ok();
    }

    /// Unblock a parked coroutine so it unwinds, then join its thread. Used
    /// when the endpoint is disposed while a read is pending.
    pub(crate) fn shutdown(mut self) {
        self.resume_tx.send(Resume::Closed).ok();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl<T: Tag> Drop for Coroutine<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // By construction `dispose` calls `shutdown` (which already
            // joins) for any endpoint whose coroutine might still be
            // parked; this only runs for a coroutine that already sent
            // `Done`, so the join below is immediate.
            handle.join().ok();
        }
    }
}
