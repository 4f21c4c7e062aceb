//! Stackful coroutine primitives: `spawn`/`resume`/`yield_now`/`current`.
//!
//! SPEC_FULL.md treats these as ambient support the I/O readiness core is built on
//! top of (the distilled spec lists `create`/`resume`/`yield`/`current` as "assumed").
//! Built on the `context` crate's register-save-and-jump context switch, the same
//! building block `mioco` (the closest prior art among the retrieved examples for
//! this architecture) uses for its own coroutines.
//!
//! Only one level of switching is supported: the scheduler resumes a coroutine,
//! the coroutine eventually yields or finishes, control returns to the scheduler.
//! Coroutines never resume each other directly.

use std::cell::{Cell, RefCell};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use slab::Slab;

const DEFAULT_STACK_SIZE: usize = 128 * 1024;

const YIELD_DATA: usize = 1;
const FINISHED_DATA: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(usize);

impl CoroutineId {
    #[cfg(test)]
    pub fn dangling() -> CoroutineId {
        CoroutineId(usize::MAX)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Running,
    Finished,
}

struct Slot {
    state: State,
    // Suspended register state, `None` only while `Running`.
    context: Option<Context>,
    // Kept alive for as long as `context` might resume into it; dropped (and the
    // guarded pages unmapped) when the slot is removed after the coroutine finishes.
    #[allow(dead_code)]
    stack: ProtectedFixedSizeStack,
    // The closure to run, taken on first resume.
    body: Option<Box<dyn FnOnce()>>,
}

thread_local! {
    static SLOTS: RefCell<Slab<Slot>> = RefCell::new(Slab::new());
    static CURRENT: Cell<Option<CoroutineId>> = Cell::new(None);
    // The context to jump back into from `yield_now`/on finish: whoever last called
    // `resume`. Valid only while some coroutine is actually running.
    static RETURN_CTX: RefCell<Option<Context>> = RefCell::new(None);
}

extern "C" fn trampoline(t: Transfer) -> ! {
    RETURN_CTX.with(|r| *r.borrow_mut() = Some(t.context));

    let id = CURRENT.with(|c| c.get()).expect("corowait: trampoline entered without CURRENT set");
    let body = SLOTS
        .with(|s| s.borrow_mut()[id.0].body.take())
        .expect("corowait: coroutine entered with no body");

    log::trace!("coroutine {} starting", id.0);
    body();
    log::trace!("coroutine {} finished", id.0);

    SLOTS.with(|s| s.borrow_mut()[id.0].state = State::Finished);
    let ctx = RETURN_CTX
        .with(|r| r.borrow_mut().take())
        .expect("corowait: no return context at coroutine exit");
    let _ = ctx.resume(FINISHED_DATA);
    unreachable!("corowait: resumed a finished coroutine");
}

/// Schedule a new coroutine. It does not run until [`resume`] is called on its id.
pub fn spawn<F: FnOnce() + 'static>(f: F) -> CoroutineId {
    let stack = ProtectedFixedSizeStack::new(DEFAULT_STACK_SIZE)
        .expect("corowait: failed to allocate a coroutine stack");
    // SAFETY: `stack` outlives `context` (both live in the same `Slot`, moved
    // together; the context only ever addresses the stack's mapped pages, which a
    // move of the `ProtectedFixedSizeStack` handle itself does not invalidate).
    let context = unsafe { Context::new(&stack, trampoline) };
    let slot = Slot { state: State::Ready, context: Some(context), stack, body: Some(Box::new(f)) };
    SLOTS.with(|s| CoroutineId(s.borrow_mut().insert(slot)))
}

/// Resume coroutine `id`. Returns once it yields or finishes. A resume of an
/// already-`Running` or already-`Finished` coroutine is a safe no-op, per the
/// distilled spec's "a redundant resume is safe" requirement.
pub fn resume(id: CoroutineId) {
    let context = SLOTS.with(|s| {
        let mut slots = s.borrow_mut();
        let Some(slot) = slots.get_mut(id.0) else {
            return None;
        };
        match slot.state {
            State::Running | State::Finished => None,
            State::Ready => {
                slot.state = State::Running;
                slot.context.take()
            }
        }
    });
    let Some(context) = context else {
        return;
    };

    log::trace!("resuming coroutine {}", id.0);
    let prev_current = CURRENT.with(|c| c.replace(Some(id)));
    let Transfer { context: suspended_at, data } = context.resume(0);
    CURRENT.with(|c| c.set(prev_current));

    SLOTS.with(|s| {
        let mut slots = s.borrow_mut();
        if data == FINISHED_DATA {
            slots.remove(id.0);
        } else {
            let slot = &mut slots[id.0];
            slot.context = Some(suspended_at);
            slot.state = State::Ready;
        }
    });
}

/// True if `id` refers to a coroutine that has not yet finished (and not yet been
/// forgotten by a call to [`resume`] that observed it finishing).
pub fn is_live(id: CoroutineId) -> bool {
    SLOTS.with(|s| s.borrow().contains(id.0))
}

/// Suspend the calling coroutine, returning control to whoever called [`resume`].
/// Resumes exactly where it left off the next time this id is resumed.
///
/// # Panics
/// Panics if called outside of a running coroutine.
pub fn yield_now() {
    let ctx = RETURN_CTX
        .with(|r| r.borrow_mut().take())
        .expect("corowait: yield_now() called outside a running coroutine");
    let Transfer { context, .. } = ctx.resume(YIELD_DATA);
    RETURN_CTX.with(|r| *r.borrow_mut() = Some(context));
}

/// The coroutine currently running on this thread.
///
/// # Panics
/// Panics if called outside of a running coroutine, per the distilled spec's
/// `current_coroutine()` contract (a programmer error if used from the scheduler).
pub fn current() -> CoroutineId {
    CURRENT.with(|c| c.get()).expect("corowait: current() called outside a running coroutine")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn runs_to_completion_and_yields_in_between() {
        let trace = Rc::new(StdRefCell::new(Vec::<&'static str>::new()));
        let t1 = trace.clone();
        let id = spawn(move || {
            t1.borrow_mut().push("a");
            yield_now();
            t1.borrow_mut().push("b");
        });

        assert!(is_live(id));
        resume(id);
        assert_eq!(*trace.borrow(), vec!["a"]);
        assert!(is_live(id));

        resume(id);
        assert_eq!(*trace.borrow(), vec!["a", "b"]);
        assert!(!is_live(id));

        // Resuming a finished (forgotten) id is a safe no-op.
        resume(id);
    }

    #[test]
    fn current_reports_the_running_coroutine() {
        let seen = Rc::new(StdRefCell::new(None));
        let seen2 = seen.clone();
        let id = spawn(move || {
            *seen2.borrow_mut() = Some(current());
        });
        resume(id);
        assert_eq!(*seen.borrow(), Some(id));
    }
}
