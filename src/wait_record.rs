//! `WaitRecord`: the state for one outstanding `co_poll` call. See SPEC_FULL.md §3.

use crate::coroutine::CoroutineId;
use crate::timer::TimerHandle;

/// A caller-supplied, caller-owned poll entry. Layout-compatible with `libc::pollfd`
/// but kept as our own type so `events`/`revents` stay in the portable poll
/// vocabulary regardless of what the kernel facility underneath happens to be.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: std::os::fd::RawFd,
    pub events: u16,
    pub revents: u16,
}

impl PollFd {
    pub fn new(fd: std::os::fd::RawFd, events: u16) -> PollFd {
        PollFd { fd, events, revents: 0 }
    }
}

/// Outcome of a `co_poll` call, set exactly once before the coroutine is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetCode {
    Pending,
    Ready,
    Timeout,
    Error,
}

/// One outstanding `co_poll` call's bookkeeping. Stack-allocated inside the calling
/// coroutine's frame in spirit (in practice: on the heap behind a `Box` pinned for
/// the duration of the yield, since Rust coroutines here are plain closures rather
/// than a frame the reactor can address directly — see `coroutine.rs`). Cross-linked
/// into one `FdSlot` per entry in `fds` for the duration of the wait.
pub struct WaitRecord {
    pub fds: Vec<PollFd>,
    pub num_ready: usize,
    pub retcode: RetCode,
    pub coroutine: CoroutineId,
    pub timer: Option<TimerHandle>,
    /// Set by the reactor when this waiter is pushed onto a tick's dispatch queue,
    /// so that a second hit in the same tick doesn't enqueue it twice (§4.2 step 2b).
    pub(crate) queued: bool,
}

impl WaitRecord {
    pub fn new(fds: Vec<PollFd>, coroutine: CoroutineId) -> WaitRecord {
        WaitRecord {
            fds,
            num_ready: 0,
            retcode: RetCode::Pending,
            coroutine,
            timer: None,
            queued: false,
        }
    }

    /// Record a hit on entry `idx`, OR-ing `poll_bits` into its `revents`. Returns
    /// true the first time a given index gets any bits set (used by the reactor to
    /// decide whether to bump `num_ready`).
    pub fn record_hit(&mut self, idx: usize, poll_bits: u16) -> bool {
        let entry = &mut self.fds[idx];
        let first_hit = entry.revents == 0;
        entry.revents |= poll_bits;
        if first_hit {
            self.num_ready += 1;
        }
        first_hit
    }
}
