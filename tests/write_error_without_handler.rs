//! End-to-end scenario: a write-time I/O error on an endpoint opened with
//! `use_error_handler = false` has no handler willing to receive it, so it
//! must propagate out of `Reactor::start()` as an `Err` instead of being
//! logged and dropped.
use reactor::{Config, Context, Handler, Reactor};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct FileTag;

struct Writer;

impl Handler for Writer {
    type Tag = FileTag;

    fn user_event(&mut self, ctx: &mut Context<'_, FileTag>, _event: Box<dyn std::any::Any + Send>) {
        if let Some(mut io) = ctx.find_io_by_tag(&FileTag) {
            io.write(b"this write is doomed");
        }
    }
}

#[test]
fn write_error_without_handler_propagates_to_start_caller() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("readonly.bin");
    std::fs::write(&path, [0u8; 8]).unwrap();

    let mut reactor = Reactor::new(Writer, Config::default()).unwrap();
    // Opened read-only: the scheduled write can never flush, and with
    // `use_error_handler` false there is no `error` callback to escalate to.
    reactor.open(&path, "r", FileTag, false).unwrap();
    reactor.add_user_event(Box::new(()));

    // Run directly on this thread, not via `support::spawn` (which treats an
    // error return as a test failure): the whole point here is to observe
    // the `Err` `start()` returns.
    let result = reactor.start();

    assert!(result.is_err(), "start() returned Ok despite a handlerless write error");
}
