use std::any::Any;
use std::rc::Rc;

/// Opaque per-scope environment slot. Each registered [`Wrapper`] owns one
/// slot in a scope's environment array; the core never inspects the
/// contents, only passes them back to the wrapper that produced them.
///
/// Reference-counted rather than owned outright: a scope's env is restored
/// every time control re-enters it, so the slot must be cheap to hand back
/// more than once instead of being consumed on first use.
pub type EnvSlot = Rc<dyn Any>;

/// The scope-integration contract a host installs to save/restore some
/// piece of ambient state (e.g. a transaction handle, a logging MDC
/// field) across scope transitions.
///
/// Implementations must be pure with respect to the core: `snapshot`
/// captures whatever the host's ambient state currently is, `restore`
/// installs a previously captured (or newborn, via `wrap`) value, and
/// `wrap` produces the initial slot for a scope that has no parent
/// snapshot yet. The core invokes all registered wrappers as a group, in
/// registration order, and tolerates them being invoked any number of
/// times in any order relative to each other.
pub trait Wrapper {
    /// Capture the wrapper's current ambient state.
    fn snapshot(&self) -> EnvSlot;

    /// Install a previously captured (or newborn) state.
    fn restore(&self, value: EnvSlot);

    /// Produce the initial env slot for a scope created fresh (not via
    /// `usePSD` of an existing scope).
    fn wrap(&self) -> EnvSlot;
}
