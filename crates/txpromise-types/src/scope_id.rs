use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a scope (PSD), used in logging and test
/// assertions. `0` is reserved for the root scope, which is created once
/// per thread and never allocated through [`ScopeId::next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(u64);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);

    /// Allocate the next scope id for this process. Monotonically
    /// increasing; never reused, even if the scope it named has since
    /// finalized.
    pub fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "scope(root)")
        } else {
            write!(f, "scope({})", self.0)
        }
    }
}
