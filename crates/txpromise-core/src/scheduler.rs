use std::cell::RefCell;
use std::collections::VecDeque;

use txpromise_types::SchedulerStats;

/// A callback already bound to its arguments via closure capture. The
/// "asap(fn, args)" shape from a dynamically-typed host collapses to this
/// in a typed one: there is no `args` tuple to thread through separately.
type DeferredCall = Box<dyn FnOnce()>;

struct SchedulerState {
    deferred_callbacks: VecDeque<DeferredCall>,
    outside_micro_tick: bool,
    needs_new_physical_tick: bool,
    num_scheduled_calls: u64,
    tick_finalizers: Vec<Box<dyn FnOnce()>>,
    total_passes: u64,
    total_physical_ticks: u64,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            deferred_callbacks: VecDeque::new(),
            outside_micro_tick: true,
            needs_new_physical_tick: true,
            num_scheduled_calls: 0,
            tick_finalizers: Vec::new(),
            total_passes: 0,
            total_physical_ticks: 0,
        }
    }
}

thread_local! {
    static STATE: RefCell<SchedulerState> = RefCell::new(SchedulerState::new());
}

/// Hook a host integration installs to be notified "a physical tick should
/// run soon". Left unset, `asap` still queues the callback; nothing drains
/// it until something calls [`physical_tick`] directly (as a trusted
/// top-level caller, or a test, would).
type RequestTickHook = Box<dyn Fn()>;

thread_local! {
    static REQUEST_TICK_HOOK: RefCell<Option<RequestTickHook>> = const { RefCell::new(None) };
}

/// Install (or clear, with `None`) the hook invoked whenever `asap` needs a
/// fresh host task scheduled. A host integration layer is the only
/// reasonable caller of this.
pub fn set_request_tick_hook(hook: Option<RequestTickHook>) {
    REQUEST_TICK_HOOK.with(|cell| *cell.borrow_mut() = hook);
}

/// Append-only FIFO enqueue. Never runs synchronously, regardless of how
/// many micro-ticks are currently nested. Requests a fresh physical tick
/// from the host exactly when `needsNewPhysicalTick` is still set — i.e.
/// once per `outsideMicroTick` window, not once per `asap` call.
pub fn asap(callback: impl FnOnce() + 'static) {
    let should_request = STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.deferred_callbacks.push_back(Box::new(callback));
        if state.outside_micro_tick && state.needs_new_physical_tick {
            state.needs_new_physical_tick = false;
            true
        } else {
            false
        }
    });
    if should_request {
        REQUEST_TICK_HOOK.with(|cell| {
            if let Some(hook) = cell.borrow().as_ref() {
                hook();
            }
        });
    }
}

/// Returns `true` exactly on the `outsideMicroTick` true -> false
/// transition, clearing `needsNewPhysicalTick` only on that transition.
pub fn begin_micro_tick_scope() -> bool {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.outside_micro_tick {
            state.outside_micro_tick = false;
            state.needs_new_physical_tick = false;
            true
        } else {
            false
        }
    })
}

/// Drains `deferredCallbacks` in an iterative swap-and-run loop until a
/// pass leaves the queue empty, then re-opens the door for the next
/// physical tick.
pub fn end_micro_tick_scope() {
    loop {
        let batch = STATE.with(|state| {
            let mut state = state.borrow_mut();
            if state.deferred_callbacks.is_empty() {
                None
            } else {
                state.total_passes += 1;
                Some(std::mem::take(&mut state.deferred_callbacks))
            }
        });
        match batch {
            None => break,
            Some(batch) => {
                for callback in batch {
                    callback();
                }
            }
        }
    }
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.outside_micro_tick = true;
        state.needs_new_physical_tick = true;
    });
}

/// Host-facing entry point. Begins a micro-tick scope and, if that call
/// actually opened one (rather than finding one already in progress), ends
/// it once the queue has fully drained.
pub fn physical_tick() {
    STATE.with(|state| state.borrow_mut().total_physical_ticks += 1);
    if begin_micro_tick_scope() {
        end_micro_tick_scope();
    }
}

/// Increment the in-flight scheduled-listener-call counter. Paired with a
/// matching [`dec_scheduled_calls`] once the listener has actually run.
pub fn inc_scheduled_calls() {
    STATE.with(|state| state.borrow_mut().num_scheduled_calls += 1);
}

/// Decrement the in-flight counter; fires [`finalize_physical_tick`] the
/// moment it reaches zero.
pub fn dec_scheduled_calls() {
    let reached_zero = STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.num_scheduled_calls -= 1;
        state.num_scheduled_calls == 0
    });
    if reached_zero {
        finalize_physical_tick();
    }
}

/// Drains the unhandled-rejection sinks and the tick finalizers registered
/// for this physical tick. Called automatically once `numScheduledCalls`
/// returns to zero; exposed for callers (and tests) that need to force
/// finalization without going through a listener dispatch.
pub fn finalize_physical_tick() {
    crate::unhandled::flush_to_sinks();
    let finalizers = STATE.with(|state| std::mem::take(&mut state.borrow_mut().tick_finalizers));
    for finalizer in finalizers {
        finalizer();
    }
}

/// Register a callback to run once, the next time `numScheduledCalls`
/// drains to zero. Used by diagnostics and by hosts that want "end of this
/// burst of activity" notifications.
pub fn add_tick_finalizer(finalizer: impl FnOnce() + 'static) {
    STATE.with(|state| state.borrow_mut().tick_finalizers.push(Box::new(finalizer)));
}

pub fn stats() -> SchedulerStats {
    STATE.with(|state| {
        let state = state.borrow();
        SchedulerStats {
            pending_callbacks: state.deferred_callbacks.len(),
            scheduled_calls: state.num_scheduled_calls,
            total_passes: state.total_passes,
            total_physical_ticks: state.total_physical_ticks,
            captured_at: chrono::Utc::now(),
        }
    })
}
