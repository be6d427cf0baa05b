use std::time::Duration;

use crate::error::RuntimeError;
use crate::runtime::LocalRuntime;

/// Fluent configuration for a [`LocalRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) diagnostics: bool,
    pub(crate) max_chain_depth: usize,
    pub(crate) idle_heartbeat_interval: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            diagnostics: false,
            max_chain_depth: txpromise_core::diagnostics::DEFAULT_MAX_CHAIN_DEPTH,
            idle_heartbeat_interval: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn on long-stack capture for every promise created on this
    /// runtime's thread. Off by default.
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// Override how many ancestor links a long-stack chain retains before
    /// older entries are dropped. Only meaningful alongside
    /// [`Self::with_diagnostics`].
    pub fn with_max_chain_depth(mut self, depth: usize) -> Self {
        self.max_chain_depth = depth;
        self
    }

    /// Log scheduler stats at this interval while the runtime is up and
    /// otherwise idle between physical ticks. Disabled (`None`) by
    /// default; purely observational, never affects scheduling.
    pub fn with_idle_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.idle_heartbeat_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<LocalRuntime, RuntimeError> {
        LocalRuntime::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_disables_diagnostics_and_heartbeat() {
        let config = RuntimeConfig::default();
        assert!(!config.diagnostics);
        assert!(config.idle_heartbeat_interval.is_none());
    }

    #[test]
    fn builder_methods_compose() {
        let config = RuntimeConfig::new().with_diagnostics(true).with_max_chain_depth(5).with_idle_heartbeat_interval(Duration::from_secs(1));
        assert!(config.diagnostics);
        assert_eq!(config.max_chain_depth, 5);
        assert_eq!(config.idle_heartbeat_interval, Some(Duration::from_secs(1)));
    }
}
