//! Core of a scoped, user-space microtask engine: a single-threaded,
//! `Rc`/`RefCell`-based promise implementation whose continuations drain
//! within the host task that scheduled them, plus the ambient scope
//! ("PSD") machinery that follows a chain of continuations across those
//! asynchronous boundaries.
//!
//! None of the types here are `Send`/`Sync` — every piece of state lives
//! behind a `thread_local!`, and cloning a [`Promise`] or a
//! [`scope::Scope`] only ever clones a reference-counted handle onto the
//! same thread-confined cell. A host integration that needs to bridge
//! across OS threads does so above this crate, not within it.

pub mod combinators;
pub mod diagnostics;
pub mod promise;
pub mod scheduler;
pub mod scope;
mod unhandled;

pub use promise::{Outcome, Promise, Resolver};
pub use scope::{ErrorEventOutcome, Scope, UnhandledEntry};
