//! Clock abstraction and the deadline queue.
//!
//! The core never reads the system clock or arms OS timers directly. Time
//! enters through a [`Clock`] implementation and leaves as deadlines in a
//! [`TimerQueue`]; the driver sleeps until the earliest deadline and calls
//! back into the core with the current instant. Tests substitute
//! [`ManualClock`] and advance time explicitly.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Source of the current instant.
pub trait Clock {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// The real clock.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A hand-advanced clock for tests.
///
/// Clones share the same underlying instant, so a test can hold one handle
/// while the state machine holds another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    /// Create a clock starting at an arbitrary instant.
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.now.set(self.now.get() + delta);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

// ============================================================================
// Timer queue
// ============================================================================

/// Cancel token for a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a timer means when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Send the next heartbeat (or force-close if the previous one is
    /// unanswered).
    Heartbeat,
    /// A dial attempt's deadline.
    ConnectTimeout,
    /// A push's reply deadline.
    PushTimeout {
        /// Channel the push belongs to.
        channel: u64,
        /// The push within that channel.
        push: u64,
    },
    /// A channel's scheduled rejoin attempt.
    Rejoin {
        /// Channel to rejoin.
        channel: u64,
    },
}

#[derive(Debug)]
struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    kind: TimerKind,
}

/// A small queue of pending deadlines.
///
/// Linear scans are fine here: the queue holds one heartbeat, one rejoin per
/// errored channel, and one entry per outstanding push.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `kind` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, kind: TimerKind) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.push(TimerEntry { id, deadline, kind });
        id
    }

    /// Cancel a scheduled timer. Cancelling an already-fired or unknown id is
    /// a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.retain(|entry| entry.id != id);
    }

    /// Cancel every timer matching `predicate`.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&TimerKind) -> bool) {
        self.entries.retain(|entry| !predicate(&entry.kind));
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<TimerEntry> = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].deadline <= now {
                due.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|entry| entry.deadline);
        due.into_iter().map(|entry| entry.kind).collect()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now() - start, Duration::from_secs(3));

        let shared = clock.clone();
        shared.advance(Duration::from_secs(1));
        assert_eq!(clock.now() - start, Duration::from_secs(4));
    }

    #[test]
    fn test_pop_due_returns_earliest_first() {
        let clock = ManualClock::new();
        let mut queue = TimerQueue::new();
        let now = clock.now();

        queue.schedule(now + Duration::from_millis(200), TimerKind::Heartbeat);
        queue.schedule(
            now + Duration::from_millis(100),
            TimerKind::Rejoin { channel: 1 },
        );
        queue.schedule(
            now + Duration::from_millis(300),
            TimerKind::PushTimeout { channel: 1, push: 1 },
        );

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(100)));

        let due = queue.pop_due(now + Duration::from_millis(250));
        assert_eq!(
            due,
            vec![TimerKind::Rejoin { channel: 1 }, TimerKind::Heartbeat]
        );
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(300)));
    }

    #[test]
    fn test_cancel_removes_entry() {
        let clock = ManualClock::new();
        let mut queue = TimerQueue::new();
        let now = clock.now();

        let id = queue.schedule(now, TimerKind::Heartbeat);
        queue.cancel(id);
        assert!(queue.is_empty());
        assert!(queue.pop_due(now + Duration::from_secs(1)).is_empty());

        // Cancelling again is a no-op.
        queue.cancel(id);
    }

    #[test]
    fn test_cancel_where_filters_by_kind() {
        let clock = ManualClock::new();
        let mut queue = TimerQueue::new();
        let now = clock.now();

        queue.schedule(now, TimerKind::Heartbeat);
        queue.schedule(now, TimerKind::PushTimeout { channel: 2, push: 1 });
        queue.schedule(now, TimerKind::PushTimeout { channel: 3, push: 1 });

        queue.cancel_where(|kind| matches!(kind, TimerKind::PushTimeout { channel: 2, .. }));

        let due = queue.pop_due(now);
        assert_eq!(due.len(), 2);
        assert!(due.contains(&TimerKind::Heartbeat));
        assert!(due.contains(&TimerKind::PushTimeout { channel: 3, push: 1 }));
    }
}
