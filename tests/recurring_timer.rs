//! End-to-end scenario: a 100ms recurring timer left running for ~550ms
//! should fire about five times.
mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reactor::{Config, Context, Handler, Reactor};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct Tick;

struct Counter {
    fires: Arc<AtomicUsize>,
}

impl Handler for Counter {
    type Tag = Tick;

    fn timer_expired(&mut self, _ctx: &mut Context<'_, Tick>, _tag: Tick) {
        self.fires.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn recurring_timer_fires_at_cadence() {
    let fires = Arc::new(AtomicUsize::new(0));
    let handler = Counter { fires: fires.clone() };

    let mut reactor = Reactor::new(handler, Config::default()).unwrap();
    reactor.schedule_timer(Duration::from_millis(100), Tick, true, false);

    let (join, handle) = support::spawn(reactor);
    std::thread::sleep(Duration::from_millis(550));
    handle.stop().unwrap();
    join.join().unwrap();

    let count = fires.load(Ordering::SeqCst);
    assert!((4..=6).contains(&count), "expected ~5 firings, got {}", count);
}
