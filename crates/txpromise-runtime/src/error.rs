use thiserror::Error;

/// Errors raised while standing up or tearing down a [`crate::LocalRuntime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to build the host task runtime: {0}")]
    Build(#[source] std::io::Error),
}
