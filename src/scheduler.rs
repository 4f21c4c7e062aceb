//! Scheduler glue: a FIFO ready queue for freshly spawned coroutines, the
//! thread-local timer singleton, and the loop that drives everything. See
//! SPEC_FULL.md §4.5.
//!
//! Shaped after the teacher's (`miquels-nara`) `executor.rs::block_on` loop (drain
//! ready work, then block in the reactor, then run timers) and after `mioco`'s
//! `FifoSchedulerThread` (new coroutines go straight on a ready queue; the reactor's
//! `tick` is registered as the task that runs whenever nothing else is ready).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::coroutine::{self, CoroutineId};
use crate::reactor::Reactor;
use crate::timer::{Timer, TimerHandle};

thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
    static TIMER: RefCell<Weak<Timer>> = RefCell::default();
}

struct Scheduler {
    reactor: Reactor,
    timer: Rc<Timer>,
    ready: VecDeque<CoroutineId>,
}

fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHEDULER.with(|s| {
        let mut slot = s.borrow_mut();
        if slot.is_none() {
            let reactor = Reactor::current().unwrap_or_else(|| {
                Reactor::new().expect("corowait: failed to create the thread's reactor")
            });
            let timer = Rc::new(Timer::new());
            TIMER.with(|t| *t.borrow_mut() = Rc::downgrade(&timer));
            *slot = Some(Scheduler { reactor, timer, ready: VecDeque::new() });
        }
        f(slot.as_mut().unwrap())
    })
}

/// The thread-local reactor backing `co_poll`. Lazily created on first use.
pub fn reactor() -> Reactor {
    with_scheduler(|s| s.reactor.clone())
}

/// Install a timeout on the thread-local timer singleton.
pub fn set_timeout<F: FnOnce() + 'static>(deadline: std::time::Instant, on_fire: F) -> TimerHandle {
    with_scheduler(|s| s.timer.set_timeout(deadline, on_fire))
}

/// Cancel a timeout installed via [`set_timeout`]. Safe to call even if it already
/// fired.
pub fn cancel_timeout(handle: TimerHandle) {
    if let Some(timer) = TIMER.with(|t| t.borrow().upgrade()) {
        timer.cancel_timeout(handle);
    }
}

/// Schedule a new coroutine to run `f`. It is placed on the ready queue and starts
/// the next time the scheduler drains it (via [`run_until`]).
pub fn spawn<F: FnOnce() + 'static>(f: F) -> CoroutineId {
    let id = coroutine::spawn(f);
    with_scheduler(|s| s.ready.push_back(id));
    id
}

/// Drive the scheduler — draining ready coroutines, then blocking on I/O readiness
/// bounded by the next timer deadline, then firing expired timers — until `target`
/// is no longer live (it ran to completion).
pub fn run_until(target: CoroutineId) {
    loop {
        if !coroutine::is_live(target) {
            return;
        }

        while let Some(id) = with_scheduler(|s| s.ready.pop_front()) {
            if coroutine::is_live(id) {
                coroutine::resume(id);
            }
        }

        if !coroutine::is_live(target) {
            return;
        }

        let (reactor, timer) = with_scheduler(|s| (s.reactor.clone(), s.timer.clone()));
        let timeout = timer.next_deadline();
        reactor.tick(timeout);
        timer.run_expired();
    }
}

/// Convenience: spawn `f` and drive the scheduler until it finishes.
pub fn block_on<F: FnOnce() + 'static>(f: F) {
    let id = spawn(f);
    run_until(id);
}
