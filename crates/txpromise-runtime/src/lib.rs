//! Host integration layer for `txpromise-core`: a single-threaded Tokio
//! runtime that supplies the "earliest available host task" primitive the
//! core's `asap` scheduler needs, a builder-style [`RuntimeConfig`], and
//! the default `tracing`-backed unhandled-rejection sink.

mod config;
mod error;
mod runtime;
mod sink;
mod tick_source;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use runtime::LocalRuntime;
pub use tick_source::{TaskSource, TimerTaskSource, TokioTaskSource};

pub use txpromise_core as promise_core;
