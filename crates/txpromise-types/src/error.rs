use thiserror;

/// Errors produced while resolving or rejecting a promise.
///
/// These mirror the A+ "TypeError" cases that a dynamically-typed
/// implementation raises at runtime; here they are ordinary variants
/// because duck-typed `then` detection is replaced by an explicit
/// [`Outcome`](crate) return type.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PromiseError {
    /// A `then` callback (or a resolver) tried to resolve a promise with
    /// itself, directly or by returning `Outcome::Chain` pointing back at
    /// the same promise.
    #[error("cannot resolve a promise with itself")]
    SelfResolution,
}

/// Errors produced by the scope manager.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ScopeError {
    /// A scope's `finalize` hook ran more than once. Indicates a bug in
    /// the ref-counting discipline, not a user-reachable condition.
    #[error("scope {0} finalized more than once")]
    DoubleFinalize(crate::ScopeId),
}
