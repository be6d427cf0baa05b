//! Thin crate-internal façade over the per-scope bookkeeping in
//! [`crate::scope`]. Kept as its own module because it is where the
//! tick-finalize sink dispatch and the `follow()` capture mechanism are
//! documented and tested, even though the storage itself lives on
//! [`crate::scope::ScopeInner`].

use std::any::Any;
use std::rc::Rc;

pub(crate) use crate::scope::UnhandledEntry;

pub(crate) fn add(
    scope: &Rc<crate::scope::ScopeInner>,
    reason_ptr: usize,
    reason: Rc<dyn Any>,
    message: String,
    long_stack: Option<String>,
) {
    crate::scope::add_unhandled(scope, reason_ptr, reason, message, long_stack);
}

pub(crate) fn mark_handled(scope: &Rc<crate::scope::ScopeInner>, reason_ptr: usize) {
    crate::scope::mark_handled(scope, reason_ptr);
}

/// Invoked from [`crate::scheduler::finalize_physical_tick`]: each
/// unhandled-rejection list still non-empty at this point reports every
/// remaining entry to its owning scope's sink and clears itself.
pub(crate) fn flush_to_sinks() {
    crate::scope::flush_unhandled();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope;

    #[test]
    fn dedup_collapses_same_reason_pointer() {
        let scope_handle = scope::current_scope();
        let reason: Rc<dyn Any> = Rc::new("boom".to_string());
        add(&scope_handle, 0xdead, reason.clone(), "boom".into(), None);
        add(&scope_handle, 0xdead, reason, "boom again".into(), None);
        assert_eq!(scope::stats(&scope_handle).unhandled_count, 1);
        mark_handled(&scope_handle, 0xdead);
        assert_eq!(scope::stats(&scope_handle).unhandled_count, 0);
    }
}
