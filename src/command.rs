//! Cross-thread entry point into the reactor.
//!
//! The reactor owns the only thread of execution that may touch endpoint
//! state. Code running elsewhere — another thread entirely, not a handler
//! callback — reaches the reactor only by sending a [`Command`] down a
//! `crossbeam-channel` and waking the multiplexer; the reactor drains
//! commands on its own thread on every pass, exactly like it drains due
//! timers and queued user events.
use std::any::Any;
use std::io;
use std::sync::Arc;

use crossbeam_channel as chan;

/// A message accepted from off the reactor thread.
pub enum Command {
    /// Request a graceful shutdown (see [`Handle::stop`]).
    Stop,
    /// Queue an event for the handler's `user_event` callback.
    UserEvent(Box<dyn Any + Send>),
}

/// A cloneable, `Send` capability for driving the reactor from another
/// thread. This is the only sanctioned way to call `stop` or queue a user
/// event from outside the reactor thread.
#[derive(Clone)]
pub struct Handle {
    commands: chan::Sender<Command>,
    waker: Arc<popol::Waker>,
}

impl Handle {
    pub(crate) fn new(commands: chan::Sender<Command>, waker: Arc<popol::Waker>) -> Self {
        Self { commands, waker }
    }

    /// Ask the reactor to stop. Returns once the request has been queued;
    /// the loop itself exits only after pending output has drained.
    pub fn stop(&self) -> io::Result<()> {
        self.commands.send(Command::Stop).ok();
        self.waker.wake()
    }

    /// Queue a user event for delivery on the reactor's next pass.
    pub fn add_user_event(&self, event: Box<dyn Any + Send>) -> io::Result<()> {
        self.commands.send(Command::UserEvent(event)).ok();
        self.waker.wake()
    }
}
