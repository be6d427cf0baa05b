use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use txpromise_types::{EnvSlot, ScopeId, ScopeStats, Wrapper};

/// One entry in the unhandled-rejection list owned by a scope. Keyed on the
/// allocation address of the (possibly shared) `Rc<E>` a rejection reason
/// is stored in, so that a value forwarded unchanged through a chain of
/// `.then()` calls collapses to a single entry no matter how many promises
/// relayed it. `reason` carries the original `Rc<E>` behind `Any` so a
/// type-aware sink (e.g. `follow`'s) can downcast back to `E` without the
/// scope machinery itself needing to be generic over it.
pub struct UnhandledEntry {
    pub reason_ptr: usize,
    pub reason: Rc<dyn Any>,
    pub message: String,
    pub promise: ScopeId,
    /// The originating promise's long-stack string, present only when
    /// diagnostics were enabled at the time it rejected. A sink should
    /// prefer this over `message` when it is `Some`, per `spec.md` §7's
    /// "long-stack when diagnostics are enabled, else `reason.stack ||
    /// String(reason)`".
    pub long_stack: Option<String>,
}

/// A scope's privately-owned view of unhandled rejections plus the sink
/// that gets invoked for each one left standing at tick-finalize time.
struct OwnedUnhandled {
    entries: Vec<UnhandledEntry>,
    sink: Rc<dyn Fn(&UnhandledEntry)>,
}

pub(crate) struct ScopeInner {
    id: ScopeId,
    parent: Option<Rc<ScopeInner>>,
    global: bool,
    ref_count: Cell<u32>,
    finalized: Cell<bool>,
    /// `None` delegates unhandled-rejection bookkeeping to the parent
    /// scope (prototypal-style inheritance); `Some` means this scope owns
    /// its own list and sink, as the root scope and every `follow()` scope
    /// do.
    owned_unhandled: RefCell<Option<OwnedUnhandled>>,
    env: RefCell<Vec<EnvSlot>>,
    /// Extra action chained onto the default finalize (parent-ref decrement
    /// and cascade); used by `follow()` to schedule its end-of-tick check.
    extra_finalize: RefCell<Option<Box<dyn FnOnce()>>>,
}

thread_local! {
    static CURRENT_SCOPE: RefCell<Rc<ScopeInner>> = RefCell::new(new_root_scope());
    /// Scopes that own an unhandled-rejection list, tracked weakly so
    /// `finalize_physical_tick` can walk "every list currently alive"
    /// without the core needing a registry entry per ordinary scope.
    static UNHANDLED_OWNERS: RefCell<Vec<Weak<ScopeInner>>> = const { RefCell::new(Vec::new()) };
    static WRAPPERS: RefCell<Vec<Rc<dyn Wrapper>>> = const { RefCell::new(Vec::new()) };
    static GLOBAL_ERROR_LISTENERS: RefCell<Vec<Rc<dyn Fn(&UnhandledEntry) -> ErrorEventOutcome>>> =
        const { RefCell::new(Vec::new()) };
}

/// What a listener registered via [`on_error`] returns. Mirrors the
/// source's `on.error` event: a listener that returns
/// [`ErrorEventOutcome::StopDefaultHandler`] suppresses the owning scope's
/// sink for that entry; every other listener still runs regardless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorEventOutcome {
    Continue,
    StopDefaultHandler,
}

/// Register a process-wide listener invoked for every unhandled rejection
/// before the owning scope's sink runs. Addition-only, invoked in
/// registration order, mirroring [`add_wrapper`]'s discipline.
pub fn on_error(listener: Rc<dyn Fn(&UnhandledEntry) -> ErrorEventOutcome>) {
    GLOBAL_ERROR_LISTENERS.with(|l| l.borrow_mut().push(listener));
}

/// Fire every registered `on.error` listener for `entry`, returning
/// whether any of them asked to suppress the default (owning-scope) sink.
fn dispatch_global_error(entry: &UnhandledEntry) -> ErrorEventOutcome {
    GLOBAL_ERROR_LISTENERS.with(|listeners| {
        let mut outcome = ErrorEventOutcome::Continue;
        for listener in listeners.borrow().iter() {
            if listener(entry) == ErrorEventOutcome::StopDefaultHandler {
                outcome = ErrorEventOutcome::StopDefaultHandler;
            }
        }
        outcome
    })
}

fn default_root_sink(entry: &UnhandledEntry) {
    eprintln!("unhandled rejection in {}: {}", entry.promise, entry.message);
}

fn new_root_scope() -> Rc<ScopeInner> {
    let scope = Rc::new(ScopeInner {
        id: ScopeId::ROOT,
        parent: None,
        global: true,
        ref_count: Cell::new(1),
        finalized: Cell::new(false),
        owned_unhandled: RefCell::new(Some(OwnedUnhandled {
            entries: Vec::new(),
            sink: Rc::new(default_root_sink),
        })),
        env: RefCell::new(Vec::new()),
        extra_finalize: RefCell::new(None),
    });
    UNHANDLED_OWNERS.with(|owners| owners.borrow_mut().push(Rc::downgrade(&scope)));
    scope
}

/// Register a wrapper. Addition-only: wrappers can never be removed once
/// installed, and invocation order across wrappers is their registration
/// order.
pub fn add_wrapper(wrapper: Rc<dyn Wrapper>) {
    WRAPPERS.with(|w| w.borrow_mut().push(wrapper));
}

/// Replace the root scope's default (`stderr`-printing) unhandled-rejection
/// sink. A host integration layer calls this once at startup to route
/// reports through its own logging.
pub fn set_root_sink(sink: Rc<dyn Fn(&UnhandledEntry)>) {
    let mut scope = current_scope();
    while let Some(parent) = scope.parent.clone() {
        scope = parent;
    }
    if let Some(owned) = scope.owned_unhandled.borrow_mut().as_mut() {
        owned.sink = sink;
    }
}

pub(crate) fn current_scope() -> Rc<ScopeInner> {
    CURRENT_SCOPE.with(|c| c.borrow().clone())
}

pub(crate) fn incr_ref(scope: &Rc<ScopeInner>) {
    scope.ref_count.set(scope.ref_count.get() + 1);
}

pub(crate) fn decr_ref(scope: &Rc<ScopeInner>) {
    let remaining = scope.ref_count.get() - 1;
    scope.ref_count.set(remaining);
    if remaining == 0 {
        finalize(scope);
    }
}

fn finalize(scope: &Rc<ScopeInner>) {
    if scope.finalized.replace(true) {
        debug_assert!(false, "scope {} finalized more than once", scope.id);
        return;
    }
    if let Some(extra) = scope.extra_finalize.borrow_mut().take() {
        extra();
    }
    if let Some(parent) = scope.parent.clone() {
        decr_ref(&parent);
    }
}

/// Chain an additional action onto this scope's finalize, run once, the
/// first time (and only the first time) its ref count reaches zero.
pub(crate) fn set_extra_finalize(scope: &Rc<ScopeInner>, action: Box<dyn FnOnce()>) {
    *scope.extra_finalize.borrow_mut() = Some(action);
}

/// Snapshot the currently active scope's wrapper environment and switch the
/// ambient scope to `scope` for the duration of `f`, restoring the
/// previous scope on every exit path (including unwinding).
pub(crate) fn use_psd<R>(scope: &Rc<ScopeInner>, f: impl FnOnce() -> R) -> R {
    let previous = current_scope();
    if Rc::ptr_eq(&previous, scope) {
        return f();
    }
    snapshot_into(&previous);
    restore_from(scope);
    CURRENT_SCOPE.with(|c| *c.borrow_mut() = scope.clone());
    let _guard = RestoreGuard { previous };
    f()
}

struct RestoreGuard {
    previous: Rc<ScopeInner>,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let current = current_scope();
        snapshot_into(&current);
        restore_from(&self.previous);
        CURRENT_SCOPE.with(|c| *c.borrow_mut() = self.previous.clone());
    }
}

fn snapshot_into(scope: &Rc<ScopeInner>) {
    let snapshots: Vec<EnvSlot> = WRAPPERS.with(|w| w.borrow().iter().map(|w| w.snapshot()).collect());
    *scope.env.borrow_mut() = snapshots;
}

fn restore_from(scope: &Rc<ScopeInner>) {
    let env = scope.env.borrow();
    WRAPPERS.with(|wrappers| {
        let wrappers = wrappers.borrow();
        for (wrapper, slot) in wrappers.iter().zip(env.iter()) {
            wrapper.restore(slot.clone());
        }
        if env.len() < wrappers.len() {
            for wrapper in &wrappers[env.len()..] {
                wrapper.restore(wrapper.wrap());
            }
        }
    });
}

/// Create a new child scope, run `f` in it, and finalize it immediately if
/// its ref count is still zero once `f` returns (i.e. nothing async kept it
/// alive). Returns whatever `f` returns.
pub fn new_scope<R>(f: impl FnOnce() -> R) -> R {
    let parent = current_scope();
    incr_ref(&parent);
    let env: Vec<EnvSlot> = WRAPPERS.with(|w| w.borrow().iter().map(|w| w.wrap()).collect());
    let child = Rc::new(ScopeInner {
        id: ScopeId::next(),
        parent: Some(parent),
        global: false,
        ref_count: Cell::new(0),
        finalized: Cell::new(false),
        owned_unhandled: RefCell::new(None),
        env: RefCell::new(env),
        extra_finalize: RefCell::new(None),
    });
    let result = use_psd(&child, f);
    if child.ref_count.get() == 0 {
        finalize(&child);
    }
    result
}

/// Create a scope that owns its own unhandled-rejection list rather than
/// delegating to its parent's, as `follow()` needs.
pub(crate) fn new_tracked_scope(sink: Rc<dyn Fn(&UnhandledEntry)>) -> Rc<ScopeInner> {
    let parent = current_scope();
    incr_ref(&parent);
    let env: Vec<EnvSlot> = WRAPPERS.with(|w| w.borrow().iter().map(|w| w.wrap()).collect());
    let scope = Rc::new(ScopeInner {
        id: ScopeId::next(),
        parent: Some(parent),
        global: false,
        ref_count: Cell::new(0),
        finalized: Cell::new(false),
        owned_unhandled: RefCell::new(Some(OwnedUnhandled { entries: Vec::new(), sink })),
        env: RefCell::new(env),
        extra_finalize: RefCell::new(None),
    });
    UNHANDLED_OWNERS.with(|owners| owners.borrow_mut().push(Rc::downgrade(&scope)));
    scope
}

fn owning_scope_for_unhandled(scope: &Rc<ScopeInner>) -> Rc<ScopeInner> {
    let mut current = scope.clone();
    loop {
        if current.owned_unhandled.borrow().is_some() {
            return current;
        }
        current = current.parent.clone().expect("root scope always owns an unhandled list");
    }
}

pub(crate) fn add_unhandled(
    scope: &Rc<ScopeInner>,
    reason_ptr: usize,
    reason: Rc<dyn Any>,
    message: String,
    long_stack: Option<String>,
) {
    let owner = owning_scope_for_unhandled(scope);
    let mut owned = owner.owned_unhandled.borrow_mut();
    let owned = owned.as_mut().expect("checked above");
    if !owned.entries.iter().any(|e| e.reason_ptr == reason_ptr) {
        owned.entries.push(UnhandledEntry { reason_ptr, reason, message, promise: scope.id, long_stack });
    }
}

pub(crate) fn mark_handled(scope: &Rc<ScopeInner>, reason_ptr: usize) {
    let owner = owning_scope_for_unhandled(scope);
    let mut owned = owner.owned_unhandled.borrow_mut();
    if let Some(owned) = owned.as_mut() {
        owned.entries.retain(|e| e.reason_ptr != reason_ptr);
    }
}

/// Drain every unhandled-rejection list currently alive, invoking each
/// owner's sink once per remaining entry, then clearing it. Called from
/// [`crate::scheduler::finalize_physical_tick`].
pub(crate) fn flush_unhandled() {
    UNHANDLED_OWNERS.with(|owners| {
        owners.borrow_mut().retain(|weak| weak.strong_count() > 0);
        for weak in owners.borrow().iter() {
            if let Some(scope) = weak.upgrade() {
                let drained = {
                    let mut owned = scope.owned_unhandled.borrow_mut();
                    let owned = owned.as_mut().expect("owner scope always has an entry");
                    std::mem::take(&mut owned.entries)
                };
                if drained.is_empty() {
                    continue;
                }
                let sink = {
                    let owned = scope.owned_unhandled.borrow();
                    owned.as_ref().expect("owner scope always has an entry").sink.clone()
                };
                for entry in &drained {
                    if dispatch_global_error(entry) == ErrorEventOutcome::Continue {
                        sink(entry);
                    }
                }
            }
        }
    });
}

pub(crate) fn stats(scope: &Rc<ScopeInner>) -> ScopeStats {
    let owner = owning_scope_for_unhandled(scope);
    let unhandled_count = owner
        .owned_unhandled
        .borrow()
        .as_ref()
        .map(|o| o.entries.len())
        .unwrap_or(0);
    ScopeStats {
        id: scope.id,
        ref_count: scope.ref_count.get(),
        is_global: scope.global,
        unhandled_count,
        captured_at: chrono::Utc::now(),
    }
}

pub(crate) fn current_scope_stats() -> ScopeStats {
    stats(&current_scope())
}

/// Public opaque handle to a scope (PSD). The only ways to obtain one are
/// [`Scope::current`] and the closure [`wrap`] hands back — there is no
/// way to construct an arbitrary one, matching the read-only nature of a
/// `PSD` accessor.
#[derive(Clone)]
pub struct Scope(pub(crate) Rc<ScopeInner>);

impl Scope {
    /// The scope active right now — the direct analogue of reading `PSD`.
    pub fn current() -> Self {
        Scope(current_scope())
    }

    pub fn stats(&self) -> ScopeStats {
        stats(&self.0)
    }
}

/// Run `f` with `scope` temporarily active, restoring whatever was active
/// on every exit path (including unwinding). The public counterpart of the
/// internal `use_psd` every listener dispatch already goes through.
pub fn with_scope<R>(scope: &Scope, f: impl FnOnce() -> R) -> R {
    use_psd(&scope.0, f)
}

/// Capture the scope active right now and return a closure that, on each
/// call: enters a micro-tick scope, reinstates the captured scope (with
/// environment snapshot/restore) for the duration of the wrapped call,
/// invokes `f`, and always leaves the micro-tick scope it entered —
/// mirroring `spec.md` §4.2's `wrap(fn, errorCatcher?)` exactly. A panic
/// inside `f` is caught and swallowed rather than propagated: `error_catcher`,
/// if supplied, receives the panic payload; the call then yields `None`
/// instead of unwinding further, the direct analogue of the source
/// catching the callback's exception and calling `errorCatcher`.
pub fn wrap<F, R>(mut f: F, error_catcher: Option<Rc<dyn Fn(Box<dyn Any + Send>)>>) -> impl FnMut() -> Option<R>
where
    F: FnMut() -> R + 'static,
    R: 'static,
{
    let captured = current_scope();
    move || {
        let opened = crate::scheduler::begin_micro_tick_scope();
        let outcome = use_psd(&captured, || std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f())));
        if opened {
            crate::scheduler::end_micro_tick_scope();
        }
        match outcome {
            Ok(value) => Some(value),
            Err(payload) => {
                if let Some(catcher) = &error_catcher {
                    catcher(payload);
                }
                None
            }
        }
    }
}

impl ScopeInner {
    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_scope_is_global_and_never_finalizes() {
        let root = current_scope();
        assert!(root.global);
        assert_eq!(root.id, ScopeId::ROOT);
    }

    #[test]
    fn new_scope_finalizes_immediately_when_ref_stays_zero() {
        let parent_ref_before = current_scope().ref_count.get();
        new_scope(|| {
            assert_ne!(current_scope().id, ScopeId::ROOT);
        });
        assert_eq!(current_scope().ref_count.get(), parent_ref_before);
    }

    #[test]
    fn new_scope_survives_when_ref_kept_nonzero() {
        let child = new_scope(|| {
            let child = current_scope();
            incr_ref(&child);
            child
        });
        assert_eq!(child.ref_count.get(), 1);
        decr_ref(&child);
        assert_eq!(child.ref_count.get(), 0);
    }

    #[test]
    fn use_psd_restores_previous_scope_on_panic() {
        let outer = current_scope();
        let inner = new_tracked_scope(Rc::new(|_: &UnhandledEntry| {}));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            use_psd(&inner, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(Rc::ptr_eq(&current_scope(), &outer));
    }

    #[test]
    fn wrapper_snapshot_restore_round_trips_through_new_scope() {
        thread_local! {
            static TAG: Cell<Option<i32>> = const { Cell::new(None) };
        }

        struct TagWrapper;
        impl Wrapper for TagWrapper {
            fn snapshot(&self) -> EnvSlot {
                Rc::new(TAG.with(|t| t.get()))
            }
            fn restore(&self, value: EnvSlot) {
                let tag = value.downcast_ref::<Option<i32>>().copied().flatten();
                TAG.with(|t| t.set(tag));
            }
            fn wrap(&self) -> EnvSlot {
                Rc::new(None::<i32>)
            }
        }

        add_wrapper(Rc::new(TagWrapper));
        TAG.with(|t| t.set(Some(7)));
        let observed = new_scope(|| TAG.with(|t| t.get()));
        assert_eq!(observed, None);
        assert_eq!(TAG.with(|t| t.get()), Some(7));
    }

    #[test]
    fn on_error_listener_can_suppress_the_default_sink() {
        let sink_ran = Rc::new(Cell::new(false));
        let sink_ran2 = sink_ran.clone();
        let tracked = new_tracked_scope(Rc::new(move |_: &UnhandledEntry| sink_ran2.set(true)));
        incr_ref(&tracked);
        add_unhandled(&tracked, 0xfeed, Rc::new("boom".to_string()), "boom".into(), None);
        on_error(Rc::new(|_: &UnhandledEntry| ErrorEventOutcome::StopDefaultHandler));
        decr_ref(&tracked);
        flush_unhandled();
        assert!(!sink_ran.get());
    }

    #[test]
    fn wrap_reinstates_the_captured_scope_and_drains_its_own_micro_tick() {
        let child = new_tracked_scope(Rc::new(|_: &UnhandledEntry| {}));
        let observed_id = Rc::new(RefCell::new(None));
        let observed_id2 = observed_id.clone();
        let drained = Rc::new(Cell::new(false));
        let drained2 = drained.clone();
        let mut wrapped = use_psd(&child, || {
            wrap(
                move || {
                    *observed_id2.borrow_mut() = Some(current_scope().id());
                    let drained3 = drained2.clone();
                    crate::scheduler::asap(move || drained3.set(true));
                },
                None,
            )
        });
        // called from the root scope, outside any micro-tick: the captured
        // child scope must still be what `f` observes as current.
        wrapped();
        assert_eq!(*observed_id.borrow(), Some(child.id));
        // `wrap` must have entered and left its own micro-tick scope,
        // draining whatever `f` scheduled via `asap` before returning.
        assert!(drained.get());
    }

    #[test]
    fn wrap_catches_a_panic_and_invokes_the_error_catcher() {
        let caught = Rc::new(Cell::new(false));
        let caught2 = caught.clone();
        let mut wrapped = wrap(
            || -> () { panic!("boom") },
            Some(Rc::new(move |_payload: Box<dyn Any + Send>| caught2.set(true))),
        );
        assert_eq!(wrapped(), None);
        assert!(caught.get());
    }
}
