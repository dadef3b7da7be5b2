//! Shared scaffolding for the integration tests: running a [`reactor::Reactor`]
//! on a background thread and polling for handler-observed state.
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use reactor::{Handle, Handler, Reactor};

/// Move a reactor onto its own thread and start it running. Returns the
/// thread's join handle alongside a [`Handle`] for stopping it from the test's
/// main thread.
pub fn spawn<H: Handler + 'static>(mut reactor: Reactor<H>) -> (JoinHandle<()>, Handle) {
    let handle = reactor.handle();
    let join = thread::spawn(move || {
        reactor.start().expect("reactor loop exited with an error");
    });
    (join, handle)
}

/// Poll `cond` until it returns `true` or `timeout` elapses. Used to wait on
/// handler-side state set from the reactor thread without a fixed sleep.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
