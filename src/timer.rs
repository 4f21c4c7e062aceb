//! The timing wheel `co_poll`'s timeout argument needs. SPEC_FULL.md §4.7.
//!
//! Shaped after the teacher's (`miquels-nara`) `time.rs`: a `BTreeMap` ordered by
//! `(deadline, id)`, `id` breaking ties between timers that share a deadline. Unlike
//! the teacher, whose `Sleep` is a `Future` woken via a `Waker`, this timer fires a
//! plain callback, since `co_poll`'s suspension point is a coroutine yield rather
//! than a poll.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: Instant,
    id: u64,
}

/// A handle returned by [`Timer::set_timeout`], used to cancel the timer before it
/// fires.
#[derive(Debug, Clone, Copy)]
pub struct TimerHandle {
    key: TimerKey,
}

type OnFire = Box<dyn FnOnce()>;

pub struct Timer {
    inner: RefCell<InnerTimer>,
}

struct InnerTimer {
    timers: BTreeMap<TimerKey, OnFire>,
    next_id: u64,
}

impl Timer {
    pub fn new() -> Timer {
        Timer { inner: RefCell::new(InnerTimer { timers: BTreeMap::new(), next_id: 1 }) }
    }

    /// Install a callback to run at `deadline`. Returns a handle that can cancel it.
    pub fn set_timeout<F: FnOnce() + 'static>(&self, deadline: Instant, on_fire: F) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let key = TimerKey { deadline, id };
        inner.timers.insert(key, Box::new(on_fire));
        TimerHandle { key }
    }

    /// Cancel a timer before it fires. A no-op if it already fired (or was already
    /// cancelled) — callers are not expected to track that themselves.
    pub fn cancel_timeout(&self, handle: TimerHandle) {
        self.inner.borrow_mut().timers.remove(&handle.key);
    }

    /// How long until the next timer is due, for use as the reactor's `tick`
    /// timeout. `None` means no timers are pending (wait forever).
    pub fn next_deadline(&self) -> Option<Duration> {
        let inner = self.inner.borrow();
        let (first, _) = inner.timers.first_key_value()?;
        let now = Instant::now();
        Some(first.deadline.saturating_duration_since(now))
    }

    /// Fire (and remove) every timer whose deadline has passed.
    pub fn run_expired(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut inner = self.inner.borrow_mut();
                match inner.timers.first_key_value() {
                    Some((key, _)) if key.deadline <= now => {
                        let key = *key;
                        inner.timers.remove(&key)
                    }
                    _ => None,
                }
            };
            match due {
                Some(on_fire) => on_fire(),
                None => break,
            }
        }
    }

    /// Number of timers currently pending (diagnostic).
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().timers.len()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
