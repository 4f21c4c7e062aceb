//! A thread-local reactor that multiplexes stackful coroutines over epoll, and a
//! `poll(2)`-compatible suspension primitive (`co_poll`) built on top of it.
//!
//! A typical program spawns one or more coroutines with [`spawn`] and drives them
//! with [`run`]; inside a coroutine, [`co_poll`] suspends until an fd is ready, a
//! timeout elapses, or an error occurs — the same contract as `libc::poll`, just
//! backed by a reactor instead of a blocking syscall.

pub(crate) mod coroutine;
pub(crate) mod error;
pub(crate) mod event;
pub(crate) mod fd_slot;
pub(crate) mod reactor;
pub(crate) mod scheduler;
pub(crate) mod sys;
pub(crate) mod timer;
pub(crate) mod wait_record;

pub mod poll;

pub use crate::coroutine::CoroutineId;
pub use crate::poll::{co_poll, on_close, pending_waiters};
pub use crate::reactor::Reactor;
pub use crate::wait_record::{PollFd, RetCode};

/// Schedule a new coroutine to run `f`. It starts the next time the scheduler
/// drains its ready queue (see [`run`]).
pub fn spawn<F: FnOnce() + 'static>(f: F) -> CoroutineId {
    scheduler::spawn(f)
}

/// Drive the scheduler until `target` (and anything it transitively spawns) has
/// finished.
pub fn run(target: CoroutineId) {
    scheduler::run_until(target)
}

/// Spawn `f` and drive the scheduler until it finishes. Convenient for a binary's
/// `main` or a single-coroutine test.
pub fn block_on<F: FnOnce() + 'static>(f: F) {
    scheduler::block_on(f)
}
