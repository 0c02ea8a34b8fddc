use std::fmt;

/// Errors surfaced by the pipeline engine.
///
/// Configuration and lifecycle-order errors are fatal: they point at a
/// mistake by whoever assembled the pipeline and always abort the current
/// frame. Everything else is subject to the pipeline's
/// [`ErrorMode`](kraftconfig::ErrorMode).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KraftError {
    #[error("GPU context '{0}' has been terminated")]
    ContextTerminated(String),
    #[error("GPU context '{0}' was used from its own worker thread")]
    ReentrantContextUse(String),
    #[error("GPU worker '{label}' panicked: {message}")]
    WorkerPanicked { label: String, message: String },
    #[error("failed to spawn GPU worker '{label}': {message}")]
    WorkerSpawn { label: String, message: String },
    #[error("call set_target_buffer before executing the pipeline")]
    MissingTargetBuffer,
    #[error("required uniform '{name}' not found in program '{program}'")]
    UnresolvedUniform { program: String, name: String },
    #[error("uniform '{name}' has an invalid shape: {reason}")]
    InvalidUniformShape { name: String, reason: String },
    #[error("buffer '{0}' has no texture to sample from")]
    TextureUnavailable(String),
    #[error("pipeline '{0}' has been destroyed")]
    PipelineDestroyed(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl KraftError {
    pub fn backend(message: impl fmt::Display) -> Self {
        KraftError::Backend(message.to_string())
    }

    /// True for configuration and lifecycle-order errors, which are never swallowed.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            KraftError::Backend(_) | KraftError::TextureUnavailable(_)
        )
    }
}
