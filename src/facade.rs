//! The synchronous-looking read/write surface handed to handler callbacks.
//!
//! Two shapes share one public type, [`Context`]. Handler callbacks that run
//! on a suspendable per-endpoint coroutine (`client_init`, `server_init`,
//! `recv_data`) get a *channel-backed* context: every operation, including
//! `read`, is a blocking round trip over a pair of `crossbeam-channel`
//! rendezvous channels to the reactor thread, which is the only thing
//! allowed to touch endpoint state — the coroutine thread never learns
//! *which* endpoint it belongs to beyond what the reactor tells it back.
//! Callbacks that run directly on the reactor thread (`timer_expired`,
//! `error`, `connect_error`, `user_event`) get a *direct* context borrowing
//! reactor state for the duration of the call, and reading through it
//! always fails — see the timer/read interaction rule.
use std::any::Any;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::time::Duration;

use crossbeam_channel as chan;

use crate::endpoint::EndpointId;
use crate::error::Error;
use crate::handler::Tag;
use crate::reactor::ReactorState;
use crate::time::TimerHandle;

/// Which endpoint a request targets. `Current` is resolved entirely on the
/// reactor side: neither half of the channel needs to know which endpoint
/// it is.
#[derive(Debug, Clone)]
pub(crate) enum Target<T> {
    Current,
    Tag(T),
}

/// Sent from a coroutine thread to the reactor thread. Every variant but
/// `Need` is answered immediately and the coroutine thread keeps running
/// without giving control back to the event loop; `Need` parks the
/// coroutine thread until more bytes arrive (or the endpoint is disposed).
pub(crate) enum Request<T> {
    Need(usize),
    Write(Target<T>, Vec<u8>),
    Seek(Target<T>, SeekFrom),
    Close(Target<T>),
    CurrentTag,
    FindByTag(T),
    SetMetaInfo(T),
    ScheduleTimer {
        duration: Duration,
        tag: T,
        recurring: bool,
        immediate: bool,
    },
    CancelTimer(TimerHandle),
    AddUserEvent(Box<dyn Any + Send>),
    /// The handler callback returned normally. Sent once, as the coroutine
    /// thread's last act before exiting; the reactor checks the endpoint's
    /// state afterwards to decide whether a hard read error needs
    /// escalating to `error`.
    Done,
    /// The handler callback panicked. Sent once, as the coroutine thread's
    /// last act before exiting, in place of `Done`. Carries the panic
    /// payload rendered as a string; the reactor treats this exactly like a
    /// hard read error — mark the endpoint errored, escalate to `error` if
    /// `use_error_handler` is set, and dispose it — rather than letting the
    /// panic unwind into the handler's shared `Mutex` and poison it.
    Panicked(String),
}

/// Sent from the reactor thread back to a parked coroutine thread.
pub(crate) enum Resume<T> {
    Data(Vec<u8>),
    Ack,
    Found(bool),
    Tag(Option<T>),
    Timer(TimerHandle),
    /// The endpoint is being disposed, or read off a hard error; the
    /// coroutine thread unwinds.
    Closed,
}

/// The channel-backed half: owned by a coroutine thread for the life of one
/// handler callback invocation, across however many suspensions it takes.
pub(crate) struct ChannelInner<T: Tag> {
    request_tx: chan::Sender<Request<T>>,
    resume_rx: chan::Receiver<Resume<T>>,
    pending: VecDeque<u8>,
}

impl<T: Tag> ChannelInner<T> {
    pub(crate) fn new(request_tx: chan::Sender<Request<T>>, resume_rx: chan::Receiver<Resume<T>>) -> Self {
        Self {
            request_tx,
            resume_rx,
            pending: VecDeque::new(),
        }
    }

    fn round_trip(&self, request: Request<T>) -> Resume<T> {
        self.request_tx.send(request).ok();
        self.resume_rx.recv().unwrap_or(Resume::Closed)
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        while self.pending.len() < n {
            let need = n - self.pending.len();
            match self.round_trip(Request::Need(need)) {
                Resume::Data(chunk) => self.pending.extend(chunk),
                _ => {
                    return Err(Error::InvalidContext(
                        "endpoint closed or errored during read",
                    ))
                }
            }
        }
        Ok(self.pending.drain(..n).collect())
    }
}

/// The direct half: a short-lived borrow of reactor state, used for
/// callbacks that run inline on the reactor thread and can never suspend.
/// `current` is `None` for `user_event`, which has no associated endpoint.
pub(crate) struct DirectInner<'a, T: Tag> {
    pub(crate) state: &'a mut ReactorState<T>,
    pub(crate) current: Option<EndpointId>,
}

enum Inner<'a, T: Tag> {
    Channel(ChannelInner<T>),
    Direct(DirectInner<'a, T>),
}

/// The read/write/scheduling surface passed into every handler callback.
pub struct Context<'a, T: Tag> {
    inner: Inner<'a, T>,
}

/// A lookup result from [`Context::find_io_by_tag`], used to write to or
/// close an endpoint other than the current one.
pub struct RemoteIo<'ctx, 'a, T: Tag> {
    ctx: &'ctx mut Context<'a, T>,
    tag: T,
}

impl<'ctx, 'a, T: Tag> RemoteIo<'ctx, 'a, T> {
    /// Append bytes to the target endpoint's output buffer.
    pub fn write(&mut self, bytes: &[u8]) {
        self.ctx
            .dispatch(Request::Write(Target::Tag(self.tag.clone()), bytes.to_vec()));
    }

    /// Seek the target endpoint, if it is seekable (a no-op otherwise).
    pub fn seek(&mut self, pos: SeekFrom) {
        self.ctx.dispatch(Request::Seek(Target::Tag(self.tag.clone()), pos));
    }

    /// Dispose the target endpoint.
    pub fn close(&mut self) {
        self.ctx.dispatch(Request::Close(Target::Tag(self.tag.clone())));
    }
}

impl<'a, T: Tag> Context<'a, T> {
    pub(crate) fn channel(inner: ChannelInner<T>) -> Self {
        Self {
            inner: Inner::Channel(inner),
        }
    }

    pub(crate) fn direct(state: &'a mut ReactorState<T>, current: Option<EndpointId>) -> Self {
        Self {
            inner: Inner::Direct(DirectInner { state, current }),
        }
    }

    fn dispatch(&mut self, request: Request<T>) -> Resume<T> {
        match &mut self.inner {
            Inner::Channel(c) => c.round_trip(request),
            Inner::Direct(d) => d.state.apply(d.current, request),
        }
    }

    /// Read exactly `n` bytes, accumulating across coroutine suspensions.
    /// Fails immediately if called from a callback that runs directly on
    /// the reactor thread (no suspension is possible there).
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        match &mut self.inner {
            Inner::Channel(c) => c.read(n),
            Inner::Direct(_) => Err(Error::InvalidContext(
                "cannot read from an endpoint while a timer callback is active",
            )),
        }
    }

    /// Append bytes to the current endpoint's output buffer. Never
    /// syscalls directly; the reactor flushes on writability.
    pub fn write(&mut self, bytes: &[u8]) {
        self.dispatch(Request::Write(Target::Current, bytes.to_vec()));
    }

    /// Seek the current endpoint, if it is seekable (a no-op otherwise).
    pub fn seek(&mut self, pos: SeekFrom) {
        self.dispatch(Request::Seek(Target::Current, pos));
    }

    /// Dispose the current endpoint.
    pub fn close(&mut self) {
        self.dispatch(Request::Close(Target::Current));
    }

    /// The tag of the endpoint currently being serviced, or `None` for a
    /// freshly accepted connection that hasn't been given one yet (see
    /// [`Context::set_meta_info`]) or for a callback with no current
    /// endpoint at all (`user_event`).
    pub fn current_io(&mut self) -> Option<T> {
        match self.dispatch(Request::CurrentTag) {
            Resume::Tag(tag) => tag,
            _ => None,
        }
    }

    /// Look up another live, tagged endpoint, for writing to or closing it.
    pub fn find_io_by_tag(&mut self, tag: &T) -> Option<RemoteIo<'_, 'a, T>> {
        let found = matches!(self.dispatch(Request::FindByTag(tag.clone())), Resume::Found(true));

        if found {
            Some(RemoteIo {
                ctx: self,
                tag: tag.clone(),
            })
        } else {
            None
        }
    }

    /// Assign (or replace) the current endpoint's metadata tag.
    pub fn set_meta_info(&mut self, tag: T) {
        self.dispatch(Request::SetMetaInfo(tag));
    }

    /// Schedule a timer. Immediate timers fire on the next loop pass.
    pub fn schedule_timer(
        &mut self,
        duration: Duration,
        tag: T,
        recurring: bool,
        immediate: bool,
    ) -> TimerHandle {
        match self.dispatch(Request::ScheduleTimer {
            duration,
            tag,
            recurring,
            immediate,
        }) {
            Resume::Timer(handle) => handle,
            _ => unreachable!("schedule_timer always replies with a handle"),
        }
    }

    /// Cancel a previously scheduled timer. Lazy: the entry lingers in the
    /// heap until it would otherwise become the minimum.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.dispatch(Request::CancelTimer(handle));
    }

    /// Queue a user event for delivery on the next pass.
    pub fn add_user_event(&mut self, event: Box<dyn Any + Send>) {
        self.dispatch(Request::AddUserEvent(event));
    }
}
