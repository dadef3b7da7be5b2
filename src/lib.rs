//! A single-threaded, non-blocking I/O reactor.
//!
//! [`Reactor`] multiplexes TCP listeners, TCP streams and local files on one
//! `popol`-backed readiness loop, while every [`Handler`] callback that can
//! plausibly want to suspend mid-read (`client_init`, `server_init`,
//! `recv_data`) runs on its own OS thread — a *coroutine* in everything but
//! name — blocked the instant it calls [`Context::read`] for bytes that
//! haven't arrived yet. Exactly one thread is ever runnable at a time: the
//! reactor thread blocks on the coroutine's request channel the moment it
//! resumes it, and the coroutine thread blocks on the reactor's reply the
//! moment it asks for anything, so the handler (behind a `Mutex` that is by
//! construction never contended) never needs its own synchronization.
//!
//! Callbacks that cannot meaningfully suspend (`timer_expired`, `error`,
//! `connect_error`, `user_event`) run directly on the reactor thread instead,
//! against a [`Context`] that borrows reactor state rather than crossing a
//! channel — and whose `read` always fails, since there is no coroutine
//! thread there to suspend.
//!
//! A pass through the event loop: compute readiness sets, check for a
//! completed shutdown, drain any timers due, deliver queued user events,
//! poll, then dispatch readiness — reads before writes. See [`Reactor::start`].
mod command;
mod coroutine;
mod endpoint;
mod error;
mod facade;
mod handler;
mod output;
mod rate;
mod reactor;
mod time;

pub use command::{Command, Handle};
pub use error::Error;
pub use facade::{Context, RemoteIo};
pub use handler::{Handler, Tag};
pub use rate::RateEstimator;
pub use reactor::{Config, Reactor};
pub use time::{LocalDuration, LocalTime, TimerHandle};
