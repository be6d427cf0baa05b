//! Long-stack diagnostics: when enabled, every promise records where it was
//! created and, for promises created while another promise's listener was
//! running, a link back to that promise's own chain. `stack()` walks the
//! chain lazily and only once, since the chain is immutable the moment a
//! promise becomes terminal.

use std::cell::{Cell, RefCell};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

/// Default maximum number of ancestor links retained per promise, unless a
/// host overrides it via [`set_max_chain_depth`]. Older links are dropped
/// rather than grown without bound.
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 100;

/// Maximum number of ancestor frames rendered by [`DiagLink::stack`].
const MAX_RENDERED_ANCESTORS: usize = 20;

thread_local! {
    static ENABLED: Cell<bool> = const { Cell::new(false) };
    static MAX_CHAIN_DEPTH: Cell<usize> = const { Cell::new(DEFAULT_MAX_CHAIN_DEPTH) };
    /// The diag link of the promise whose listener is presently executing.
    /// Swapped in around a listener's handler invocation so that promises
    /// freshly constructed from inside a handler (via `Promise::new`)
    /// chain onto it.
    static CURRENT_FULFILLER: RefCell<Option<std::rc::Rc<DiagLink>>> = const { RefCell::new(None) };
}

/// Turn long-stack capture on or off for the current thread. Off by
/// default: capturing a backtrace on every promise construction is not
/// free, and most callers don't need it outside debugging sessions.
pub fn set_enabled(enabled: bool) {
    ENABLED.with(|cell| cell.set(enabled));
}

pub fn is_enabled() -> bool {
    ENABLED.with(|cell| cell.get())
}

/// Override how many ancestor links a chain retains before older entries
/// are dropped. A host integration exposes this as a configuration knob;
/// left untouched, the cap is [`DEFAULT_MAX_CHAIN_DEPTH`].
pub fn set_max_chain_depth(depth: usize) {
    MAX_CHAIN_DEPTH.with(|cell| cell.set(depth));
}

fn max_chain_depth() -> usize {
    MAX_CHAIN_DEPTH.with(|cell| cell.get())
}

pub(crate) struct DiagLink {
    location: &'static std::panic::Location<'static>,
    backtrace: std::backtrace::Backtrace,
    captured_at: DateTime<Utc>,
    prev: Option<std::rc::Rc<DiagLink>>,
    num_prev: usize,
    cached_stack: RefCell<Option<String>>,
}

impl DiagLink {
    #[track_caller]
    pub(crate) fn capture(prev: Option<std::rc::Rc<DiagLink>>) -> std::rc::Rc<Self> {
        let location = std::panic::Location::caller();
        let cap = max_chain_depth();
        let num_prev = match &prev {
            Some(p) if p.num_prev + 1 < cap => p.num_prev + 1,
            Some(_) => cap,
            None => 0,
        };
        let prev = if num_prev >= cap { None } else { prev };
        std::rc::Rc::new(Self {
            location,
            backtrace: std::backtrace::Backtrace::capture(),
            captured_at: Utc::now(),
            prev,
            num_prev,
            cached_stack: RefCell::new(None),
        })
    }

    pub(crate) fn stack(&self) -> String {
        if let Some(cached) = self.cached_stack.borrow().as_ref() {
            return cached.clone();
        }
        let mut rendered = String::new();
        let mut node = Some(self);
        let mut depth = 0;
        while let Some(current) = node {
            if depth > 0 {
                let _ = write!(rendered, "\nFrom previous:");
            }
            let _ = write!(
                rendered,
                "\n  at {} ({})\n{}",
                current.location,
                current.captured_at.to_rfc3339(),
                current.backtrace
            );
            depth += 1;
            if depth >= MAX_RENDERED_ANCESTORS {
                break;
            }
            node = current.prev.as_deref();
        }
        *self.cached_stack.borrow_mut() = Some(rendered.clone());
        rendered
    }
}

/// Capture a link if diagnostics are enabled, chaining onto `prev` (the
/// creating promise's own link, when one is known via
/// [`crate::scheduler::current_fulfiller`]).
#[track_caller]
pub(crate) fn capture_if_enabled(prev: Option<std::rc::Rc<DiagLink>>) -> Option<std::rc::Rc<DiagLink>> {
    if is_enabled() {
        Some(DiagLink::capture(prev))
    } else {
        None
    }
}

/// The diag link of the promise currently running a listener, if any and if
/// diagnostics are enabled.
pub(crate) fn current_fulfiller_link() -> Option<std::rc::Rc<DiagLink>> {
    CURRENT_FULFILLER.with(|cell| cell.borrow().clone())
}

/// Swap in a new "currently executing" diag link for the duration of `f`,
/// restoring the previous one on every exit path including unwinding.
pub(crate) fn with_current_fulfiller<R>(link: Option<std::rc::Rc<DiagLink>>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<std::rc::Rc<DiagLink>>);
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT_FULFILLER.with(|cell| *cell.borrow_mut() = self.0.take());
        }
    }
    let previous = CURRENT_FULFILLER.with(|cell| cell.replace(link));
    let _restore = Restore(previous);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_depth_is_capped() {
        set_enabled(true);
        let mut link = DiagLink::capture(None);
        for _ in 0..(DEFAULT_MAX_CHAIN_DEPTH + 10) {
            link = DiagLink::capture(Some(link));
        }
        assert!(link.num_prev <= DEFAULT_MAX_CHAIN_DEPTH);
        set_enabled(false);
    }

    #[test]
    fn max_chain_depth_override_is_respected() {
        set_enabled(true);
        set_max_chain_depth(3);
        let mut link = DiagLink::capture(None);
        for _ in 0..10 {
            link = DiagLink::capture(Some(link));
        }
        assert_eq!(link.num_prev, 3);
        set_max_chain_depth(DEFAULT_MAX_CHAIN_DEPTH);
        set_enabled(false);
    }

    #[test]
    fn stack_is_cached_after_first_render() {
        set_enabled(true);
        let link = DiagLink::capture(None);
        let first = link.stack();
        let second = link.stack();
        assert_eq!(first, second);
        set_enabled(false);
    }
}
