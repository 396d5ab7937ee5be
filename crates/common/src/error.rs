//! Error types shared across nvcap crates.

/// Top-level error type for nvcap operations.
#[derive(Debug, thiserror::Error)]
pub enum NvcapError {
    #[error("Display error: {message}")]
    Display { message: String },

    #[error("{op} failed with status {status}")]
    Device { op: &'static str, status: i32 },

    /// The capture session went stale (mode change, resolution change) and
    /// has to be rebuilt before further grabs can succeed.
    #[error("Capture session must be recreated")]
    MustRecreate,

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    #[error("Session rebuild failed: {message}")]
    Rebuild { message: String },

    #[error("Capture session still invalid after {attempts} grab attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Context is unusable after a failed session rebuild; close it")]
    ContextPoisoned,

    #[error("Context is closed")]
    Closed,

    #[error("Worker thread is gone")]
    WorkerGone,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using NvcapError.
pub type NvcapResult<T> = Result<T, NvcapError>;

impl NvcapError {
    pub fn display(msg: impl Into<String>) -> Self {
        Self::Display {
            message: msg.into(),
        }
    }

    pub fn device(op: &'static str, status: i32) -> Self {
        Self::Device { op, status }
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: msg.into(),
        }
    }

    pub fn rebuild(msg: impl Into<String>) -> Self {
        Self::Rebuild {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this is the recoverable stale-session signal from a grab.
    pub fn is_must_recreate(&self) -> bool {
        matches!(self, Self::MustRecreate)
    }
}
