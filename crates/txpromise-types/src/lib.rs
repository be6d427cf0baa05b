pub mod error;
pub mod scope_id;
pub mod stats;
pub mod wrapper;

pub use error::{PromiseError, ScopeError};
pub use scope_id::ScopeId;
pub use stats::{SchedulerStats, ScopeStats};
pub use wrapper::{EnvSlot, Wrapper};
