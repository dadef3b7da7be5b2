//! Timer manager: a min-heap of expiries with lazy cancellation.
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, SystemTime};

/// A point in time, as tracked by the reactor.
pub type LocalTime = SystemTime;
/// A span of time.
pub type LocalDuration = Duration;

/// Opaque handle to a scheduled timer, returned by [`TimeoutManager::add`] and
/// consumed by [`TimeoutManager::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry<T> {
    id: u64,
    duration: LocalDuration,
    recurring: bool,
    expiry: LocalTime,
    tag: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the earliest expiry sorts to the top.
        other.expiry.cmp(&self.expiry).then_with(|| other.id.cmp(&self.id))
    }
}

/// A priority queue of timers, keyed by expiry, with lazy cancellation.
///
/// Cancelling a timer doesn't touch the heap: the id is recorded in a side
/// set and discarded the next time it would otherwise surface as the minimum.
pub struct TimeoutManager<T> {
    heap: BinaryHeap<Entry<T>>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

impl<T> TimeoutManager<T> {
    /// Create an empty timer manager.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }

    /// Number of live timers, not counting lazily-cancelled ones still sitting
    /// in the heap.
    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.evict_cancelled();
        self.heap.is_empty()
    }

    /// Schedule a timer. `immediate` sets its first expiry to `now`, so it
    /// fires on the next pass rather than after one full `duration`.
    pub fn add(
        &mut self,
        duration: LocalDuration,
        tag: T,
        recurring: bool,
        immediate: bool,
        now: LocalTime,
    ) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;

        let expiry = if immediate { now } else { now + duration };

        self.heap.push(Entry {
            id,
            duration,
            recurring,
            expiry,
            tag,
        });

        TimerHandle(id)
    }

    /// Mark a timer cancelled. It will never fire, though it may linger in
    /// the heap until it would otherwise become the minimum.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.cancelled.insert(handle.0);
    }

    fn evict_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.remove(&top.id) {
                self.heap.pop();
            } else {
                break;
            }
        }
    }

    /// Time to wait until the earliest live timer is due, or `None` if there
    /// are no live timers. Used to compute the multiplexer's poll timeout.
    pub fn wait(&mut self, now: LocalTime) -> Option<LocalDuration> {
        self.evict_cancelled();
        self.heap
            .peek()
            .map(|e| e.expiry.duration_since(now).unwrap_or(Duration::ZERO))
    }
}

impl<T: Clone> TimeoutManager<T> {
    /// If the earliest live timer is due, pop it and return its tag,
    /// re-scheduling it first if it's recurring.
    pub fn next(&mut self, now: LocalTime) -> Option<T> {
        self.evict_cancelled();

        match self.heap.peek() {
            Some(e) if e.expiry <= now => {}
            _ => return None,
        }

        let entry = self.heap.pop().expect("peeked entry exists");

        if entry.recurring {
            self.heap.push(Entry {
                id: entry.id,
                duration: entry.duration,
                recurring: true,
                expiry: now + entry.duration,
                tag: entry.tag.clone(),
            });
        }

        Some(entry.tag)
    }
}

impl<T> Default for TimeoutManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: u64) -> LocalTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn fires_no_earlier_than_scheduled_plus_duration() {
        let mut timers = TimeoutManager::new();
        let now = t(0);
        timers.add(Duration::from_secs(10), "a", false, false, now);

        assert_eq!(timers.next(t(5)), None);
        assert_eq!(timers.next(t(9)), None);
        assert_eq!(timers.next(t(10)), Some("a"));
    }

    #[test]
    fn recurring_timer_reschedules_at_cadence() {
        let mut timers = TimeoutManager::new();
        let now = t(0);
        timers.add(Duration::from_secs(5), "tick", true, false, now);

        assert_eq!(timers.next(t(5)), Some("tick"));
        assert_eq!(timers.next(t(9)), None);
        assert_eq!(timers.next(t(10)), Some("tick"));
        assert_eq!(timers.next(t(15)), Some("tick"));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = TimeoutManager::new();
        let now = t(0);
        let a = timers.add(Duration::from_secs(1), "a", false, false, now);
        timers.add(Duration::from_secs(1), "b", false, false, now);

        timers.cancel(a);

        assert_eq!(timers.next(t(1)), Some("b"));
        assert_eq!(timers.next(t(1)), None);
    }

    #[test]
    fn immediate_timer_fires_on_next_pass() {
        let mut timers = TimeoutManager::new();
        let now = t(100);
        timers.add(Duration::from_secs(30), "now", false, true, now);

        assert_eq!(timers.next(now), Some("now"));
    }

    #[test]
    fn wait_reflects_earliest_live_timer() {
        let mut timers = TimeoutManager::new();
        let now = t(0);
        let a = timers.add(Duration::from_secs(5), "a", false, false, now);
        timers.add(Duration::from_secs(20), "b", false, false, now);

        assert_eq!(timers.wait(now), Some(Duration::from_secs(5)));

        timers.cancel(a);
        assert_eq!(timers.wait(now), Some(Duration::from_secs(20)));
    }
}
