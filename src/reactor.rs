//! The per-thread I/O readiness reactor. See SPEC_FULL.md §4.2.
//!
//! Shaped after the teacher's (`miquels-nara`) `reactor.rs`: a thread-local
//! `Rc<RefCell<InnerReactor>>` with an explicit `activate`/`deactivate` lifecycle, and
//! a small `Registration`-like cross-link type (here: `FdSlotTable` + raw pointers).
//! The kernel facility itself is `epoll` rather than the teacher's `poll(2)` vector,
//! because the spec's register/modify/delete-with-user-data-pointer contract is
//! epoll's — see SPEC_FULL.md §9 for why that's a deliberate departure from the
//! teacher's own, equally valid, design.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::event;
use crate::fd_slot::{FdSlot, FdSlotTable};
use crate::sys;
use crate::wait_record::{RetCode, WaitRecord};

/// Default `reactor_event_buffer_size`: the maximum number of events returned per
/// `epoll_wait` call. See SPEC_FULL.md §6.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 10_000;

thread_local! {
    static REACTOR: RefCell<Weak<RefCell<InnerReactor>>> = RefCell::default();
}

/// Thread-local handle to the reactor. Cheap to clone (an `Rc` bump).
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<InnerReactor>>,
}

struct InnerReactor {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    slots: FdSlotTable,
    waiting_count: usize,
    // Waiters whose first hit landed this tick, in first-hit order (§5 ordering).
    dispatch: Vec<*mut WaitRecord>,
}

impl Reactor {
    /// Create a new reactor with the default event buffer size, and make it the
    /// thread-local current reactor.
    pub fn new() -> std::io::Result<Reactor> {
        Reactor::with_event_buffer_size(DEFAULT_EVENT_BUFFER_SIZE)
    }

    pub fn with_event_buffer_size(capacity: usize) -> std::io::Result<Reactor> {
        let epoll_fd = sys::epoll_create()?;
        log::debug!("reactor created, epoll fd {epoll_fd}, buffer size {capacity}");
        let inner = InnerReactor {
            epoll_fd,
            events: vec![unsafe { std::mem::zeroed() }; capacity],
            slots: FdSlotTable::new(),
            waiting_count: 0,
            dispatch: Vec::new(),
        };
        let reactor = Reactor { inner: Rc::new(RefCell::new(inner)) };
        reactor.activate();
        Ok(reactor)
    }

    /// Make this the thread-local current reactor.
    pub fn activate(&self) {
        REACTOR.with(|r| *r.borrow_mut() = Rc::downgrade(&self.inner));
    }

    /// Clear the thread-local reference to this reactor.
    pub fn deactivate(&self) {
        REACTOR.with(|r| *r.borrow_mut() = Weak::new());
    }

    /// The thread-local current reactor, if one has been activated.
    pub fn current() -> Option<Reactor> {
        REACTOR.with(|r| r.borrow().upgrade()).map(|inner| Reactor { inner })
    }

    /// Register (or extend) interest in `bits` on `fd` for `waiter`, cross-linking
    /// `slots[fd].waiter` to it. Fatal if `fd` already has a different waiter.
    pub fn register(&self, fd: RawFd, bits: u32, waiter: *mut WaitRecord, index_in_waiter: usize) {
        self.inner.borrow_mut().register(fd, bits, waiter, index_in_waiter)
    }

    /// Clear `waiter`'s occupancy of `slots[fd]` (called as each `co_poll` entry
    /// tears down). Does not touch the kernel registration — that's swept lazily at
    /// the next dispatch, per SPEC_FULL.md §4.3.
    pub fn release(&self, fd: RawFd, waiter: *mut WaitRecord) {
        self.inner.borrow_mut().slots.release(fd, waiter);
    }

    /// Drop any kernel registration for `fd`, e.g. because the application is about
    /// to close it. See SPEC_FULL.md §4.4.
    pub fn on_close(&self, fd: RawFd) {
        self.inner.borrow_mut().on_close(fd);
    }

    /// How many `co_poll` calls are currently pending (diagnostic).
    pub fn pending_waiters(&self) -> usize {
        self.inner.borrow().waiting_count
    }

    pub(crate) fn note_wait_started(&self) {
        self.inner.borrow_mut().waiting_count += 1;
    }

    pub(crate) fn note_wait_ended(&self) {
        self.inner.borrow_mut().waiting_count -= 1;
    }

    /// Block for up to `timeout` (`None` = forever) waiting for readiness, then
    /// dispatch. Returns the number of coroutines resumed.
    pub fn tick(&self, timeout: Option<Duration>) -> usize {
        let ready = self.inner.borrow_mut().poll_kernel(timeout);
        let to_resume = self.inner.borrow_mut().dispatch_ready(ready);
        let mut resumed = 0;
        for waiter in to_resume {
            // SAFETY: every entry came from a live WaitRecord's queued-flag flip in
            // `dispatch_ready`, which only happens while that WaitRecord's `co_poll`
            // frame is still suspended on `coroutine::yield_now()`.
            let coroutine = unsafe { (*waiter).coroutine };
            crate::coroutine::resume(coroutine);
            resumed += 1;
        }
        resumed
    }
}

impl InnerReactor {
    fn register(&mut self, fd: RawFd, bits: u32, waiter: *mut WaitRecord, index_in_waiter: usize) {
        self.slots.claim(fd, waiter, index_in_waiter);
        let slot_ptr = self.slots.slot_ptr(fd);
        // SAFETY: `slot_ptr` was just produced by `slot_ptr`, always valid.
        let slot = unsafe { &mut *slot_ptr };
        let new_mask = slot.registered_mask | bits;
        let op = if slot.registered_mask == 0 { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        if let Err(e) = sys::epoll_ctl(self.epoll_fd, op, fd, event::to_epoll(new_mask), slot_ptr as u64) {
            crate::error::log_kernel_error("epoll_ctl", Some(fd), Some(new_mask), &e);
        }
        slot.registered_mask = new_mask;
    }

    fn on_close(&mut self, fd: RawFd) {
        let epoll_fd = self.epoll_fd;
        let Some(slot) = self.slots.get(fd) else { return };
        if slot.registered_mask == 0 {
            return;
        }
        if let Err(e) = sys::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, 0, 0) {
            crate::error::log_kernel_error("epoll_ctl(DEL)", Some(fd), None, &e);
        }
        self.slots.slot_mut(fd).registered_mask = 0;
    }

    fn poll_kernel(&mut self, timeout: Option<Duration>) -> usize {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };
        match sys::epoll_wait(self.epoll_fd, &mut self.events, timeout_ms) {
            Ok(n) => n,
            Err(e) => {
                crate::error::log_kernel_error("epoll_wait", None, None, &e);
                0
            }
        }
    }

    // Dispatch algorithm of SPEC_FULL.md §4.2. Returns the waiters to resume, in
    // first-hit order, having already flipped their `retcode`/`num_ready`.
    fn dispatch_ready(&mut self, ready: usize) -> Vec<*mut WaitRecord> {
        self.dispatch.clear();
        let epoll_fd = self.epoll_fd;

        for ev in &self.events[..ready] {
            let slot_ptr = ev.u64 as *mut FdSlot;
            // SAFETY: user-data pointers only ever come from `FdSlotTable::slot_ptr`
            // on this same thread, and stay valid until explicitly deregistered.
            let slot = unsafe { &mut *slot_ptr };
            let kernel_mask = event::from_epoll(ev.events);

            let waiter = unsafe { slot.waiter_mut() };
            let Some(waiter) = waiter else {
                clear_stale(epoll_fd, slot, kernel_mask);
                continue;
            };

            let idx = slot.slot_index_in_waiter;
            let wanted = event::from_poll(waiter.fds[idx].events);
            let hits = wanted & kernel_mask;

            if hits == 0 {
                clear_stale(epoll_fd, slot, kernel_mask);
                continue;
            }

            waiter.record_hit(idx, event::to_poll(hits));
            waiter.retcode = RetCode::Ready;
            if let Some(timer) = waiter.timer.take() {
                crate::scheduler::cancel_timeout(timer);
            }
            if !waiter.queued {
                waiter.queued = true;
                self.dispatch.push(waiter as *mut WaitRecord);
            }
        }

        std::mem::take(&mut self.dispatch)
    }
}

// Slot had a kernel mask the current waiter (or lack thereof) no longer wants;
// narrow (or drop) the kernel registration. SPEC_FULL.md §4.2 step 2a/2b-else.
fn clear_stale(epoll_fd: RawFd, slot: &mut FdSlot, to_clear: u32) {
    let new_mask = slot.registered_mask & !to_clear;
    if new_mask == slot.registered_mask {
        return;
    }
    if new_mask == 0 {
        if let Err(e) = sys::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, slot.fd, 0, 0) {
            crate::error::log_kernel_error("epoll_ctl(DEL, stale)", Some(slot.fd), None, &e);
        }
    } else if let Err(e) =
        sys::epoll_ctl(epoll_fd, libc::EPOLL_CTL_MOD, slot.fd, event::to_epoll(new_mask), slot as *mut FdSlot as u64)
    {
        crate::error::log_kernel_error("epoll_ctl(MOD, stale)", Some(slot.fd), Some(new_mask), &e);
    }
    slot.registered_mask = new_mask;
}

impl AsRawFd for Reactor {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.borrow().epoll_fd
    }
}

impl Drop for InnerReactor {
    fn drop(&mut self) {
        let _ = sys::close(self.epoll_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::CoroutineId;
    use crate::wait_record::PollFd;
    use std::os::fd::AsRawFd;

    fn new_record(fd: RawFd, events: u16) -> WaitRecord {
        WaitRecord::new(vec![PollFd::new(fd, events)], CoroutineId::dangling())
    }

    #[test]
    fn register_adds_then_modifies_the_kernel_mask() {
        let reactor = Reactor::with_event_buffer_size(8).unwrap();
        let (r, _w) = sys::pipe().unwrap();
        let fd = r.as_raw_fd();

        let mut a = new_record(fd, libc::POLLIN as u16);
        reactor.register(fd, event::READ, &mut a as *mut _, 0);
        assert_eq!(reactor.inner.borrow().slots.get(fd).unwrap().registered_mask, event::READ);
        reactor.release(fd, &mut a as *mut _);

        let mut b = new_record(fd, libc::POLLOUT as u16);
        reactor.register(fd, event::WRITE, &mut b as *mut _, 0);
        // The slot is unoccupied (released) but its kernel mask carries forward —
        // register unions into whatever is still registered, per SPEC_FULL.md §4.2.
        assert_eq!(
            reactor.inner.borrow().slots.get(fd).unwrap().registered_mask,
            event::READ | event::WRITE
        );
        reactor.release(fd, &mut b as *mut _);
    }

    #[test]
    fn on_close_drops_a_live_kernel_registration() {
        let reactor = Reactor::with_event_buffer_size(8).unwrap();
        let (r, _w) = sys::pipe().unwrap();
        let fd = r.as_raw_fd();

        let mut a = new_record(fd, libc::POLLIN as u16);
        reactor.register(fd, event::READ, &mut a as *mut _, 0);
        assert_ne!(reactor.inner.borrow().slots.get(fd).unwrap().registered_mask, 0);

        reactor.on_close(fd);
        assert_eq!(reactor.inner.borrow().slots.get(fd).unwrap().registered_mask, 0);
        reactor.release(fd, &mut a as *mut _);
    }

    #[test]
    fn on_close_of_an_unregistered_fd_is_a_no_op() {
        let reactor = Reactor::with_event_buffer_size(8).unwrap();
        reactor.on_close(12345);
    }
}
