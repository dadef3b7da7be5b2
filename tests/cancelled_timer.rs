//! End-to-end scenario: of two 100ms timers, cancelling one before either
//! fires should leave exactly the other one firing.
mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reactor::{Config, Context, Handler, Reactor};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum Tag {
    Kept,
    Cancelled,
}

struct Counter {
    fires: Arc<AtomicUsize>,
}

impl Handler for Counter {
    type Tag = Tag;

    fn timer_expired(&mut self, _ctx: &mut Context<'_, Tag>, tag: Tag) {
        assert_eq!(tag, Tag::Kept, "the cancelled timer fired");
        self.fires.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn cancelled_timer_never_fires() {
    let fires = Arc::new(AtomicUsize::new(0));
    let handler = Counter { fires: fires.clone() };

    let mut reactor = Reactor::new(handler, Config::default()).unwrap();
    let doomed = reactor.schedule_timer(Duration::from_millis(100), Tag::Cancelled, false, false);
    reactor.schedule_timer(Duration::from_millis(100), Tag::Kept, false, false);
    reactor.cancel_timer(doomed);

    let (join, handle) = support::spawn(reactor);
    std::thread::sleep(Duration::from_millis(300));
    handle.stop().unwrap();
    join.join().unwrap();

    assert_eq!(fires.load(Ordering::SeqCst), 1);
}
