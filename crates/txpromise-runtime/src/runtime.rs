//! Host integration: binds `txpromise-core`'s `asap` scheduling primitive
//! to a real "earliest available task" source backed by a single-threaded
//! Tokio runtime (`current_thread` flavor + `LocalSet`), the direct
//! analogue of a host event loop that dispatches exactly one task at a
//! time on one thread.

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use txpromise_core::{diagnostics, scheduler};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::sink;
use crate::tick_source::{TaskSource, TokioTaskSource};

/// A running host integration. Owns the single-threaded Tokio runtime and
/// `LocalSet` that every physical tick is dispatched through; every
/// `Promise`/`Scope` this process touches must be constructed and driven
/// from inside a [`LocalRuntime::block_on`] call on the same thread.
pub struct LocalRuntime {
    rt: tokio::runtime::Runtime,
    local: LocalSet,
    heartbeat_interval: Option<Duration>,
}

impl LocalRuntime {
    pub(crate) fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(RuntimeError::Build)?;

        diagnostics::set_enabled(config.diagnostics);
        diagnostics::set_max_chain_depth(config.max_chain_depth);
        sink::install_default_sink();

        Ok(Self { rt, local: LocalSet::new(), heartbeat_interval: config.idle_heartbeat_interval })
    }

    /// Convenience constructor for the common case of wanting the default
    /// configuration (`RuntimeConfig::default().build()`).
    pub fn default_config() -> Result<Self, RuntimeError> {
        RuntimeConfig::default().build()
    }

    /// Snapshot of the tick scheduler's counters right now. Safe to call
    /// from outside [`Self::block_on`]; reads whatever this thread's
    /// scheduler state currently holds.
    pub fn stats(&self) -> txpromise_types::SchedulerStats {
        scheduler::stats()
    }

    /// Drive `fut` to completion on this runtime's thread, installing the
    /// `asap` hook for the duration of the call and draining every
    /// physical tick it schedules along the way. Re-entrant: calling
    /// `block_on` again after a previous call returns is fine, each call
    /// re-installs the hook against the (possibly different) `TaskSource`.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.block_on_with(TokioTaskSource, fut)
    }

    /// Like [`Self::block_on`], but with an explicit [`TaskSource`] in
    /// place of the default `yield_now`-based one, for a host that wants
    /// ticks dispatched some other way (e.g.
    /// [`crate::tick_source::TimerTaskSource`]).
    pub fn block_on_with<S, F>(&self, source: S, fut: F) -> F::Output
    where
        S: TaskSource + 'static,
        F: Future,
    {
        let source = Rc::new(source);
        self.local.block_on(&self.rt, async move {
            install_tick_hook(source.clone());
            if let Some(interval) = self.heartbeat_interval {
                tokio::task::spawn_local(run_heartbeat(interval));
            }
            fut.await
        })
    }
}

/// Install the hook `asap` calls whenever work transitions from empty to
/// non-empty: spawn a local task that waits for the source's next slot,
/// then drains one physical tick. Re-installable; a later call simply
/// replaces the closure, which is harmless since only one hook is ever
/// active per thread.
fn install_tick_hook(source: Rc<dyn TaskSource>) {
    scheduler::set_request_tick_hook(Some(Box::new(move || {
        let source = source.clone();
        tokio::task::spawn_local(async move {
            source.next_slot().await;
            scheduler::physical_tick();
        });
    })));
}

/// Purely observational: logs scheduler stats on a fixed interval so a
/// host operator can see whether the queue is backing up, without ever
/// touching scheduling decisions itself.
async fn run_heartbeat(interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let stats = scheduler::stats();
        tracing::debug!(
            pending = stats.pending_callbacks,
            scheduled = stats.scheduled_calls,
            passes = stats.total_passes,
            physical_ticks = stats.total_physical_ticks,
            "scheduler heartbeat"
        );
    }
}
