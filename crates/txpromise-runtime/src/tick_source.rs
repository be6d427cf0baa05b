//! Pluggable "earliest available host task" primitives: an immediate-task
//! API where one exists, else a zero-delay timer. Exposed as an explicit,
//! swappable adapter rather than hard-wiring one host API, since a target
//! with no implicit ambient context needs the scheduler integration point
//! named rather than assumed.
//!
//! [`TokioTaskSource`] is the default: it rides Tokio's own immediate-task
//! queue via `yield_now`. [`TimerTaskSource`] is the zero-delay-timer
//! fallback for hosts where an immediate task isn't available or where
//! ticks should be spaced out deliberately (e.g. to coalesce bursts).

use std::time::Duration;

use async_trait::async_trait;

/// A source of "the host's next available task slot", used to build the
/// hook that drives [`txpromise_core::scheduler::physical_tick`].
///
/// `?Send`: every type in `txpromise-core` is thread-confined, so this
/// trait never needs to cross an executor's work-stealing boundary.
#[async_trait(?Send)]
pub trait TaskSource {
    /// Suspend until the next task slot is available, then return.
    async fn next_slot(&self);
}

/// Default adapter: Tokio's immediate-task queue via `yield_now`, the
/// direct analogue of a host's `setImmediate`/`queueMicrotask`-adjacent
/// "earliest available" primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskSource;

#[async_trait(?Send)]
impl TaskSource for TokioTaskSource {
    async fn next_slot(&self) {
        tokio::task::yield_now().await;
    }
}

/// Zero-delay-timer fallback, for hosts that want every physical tick
/// spaced at least `delay` apart rather than running at the very next
/// immediate-task opportunity.
#[derive(Debug, Clone, Copy)]
pub struct TimerTaskSource {
    delay: Duration,
}

impl TimerTaskSource {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait(?Send)]
impl TaskSource for TimerTaskSource {
    async fn next_slot(&self) {
        tokio::time::sleep(self.delay).await;
    }
}
