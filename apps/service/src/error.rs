use thiserror::Error;

/// Errors surfaced by the monitoring engine's control operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("rate limiter is closed")]
    LimiterClosed,

    #[error("monitoring is shutting down")]
    ShuttingDown,

    #[error("monitoring cycle panicked: {0}")]
    CyclePanicked(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
