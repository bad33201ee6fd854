use thiserror::Error;

/// All errors produced by cadence-core.
///
/// Engines never surface these from their per-frame or ingestion paths; they
/// only appear at setup edges (configuration, mode names, scenario files).
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("unknown scroll mode: {0}")]
    UnknownMode(String),

    #[error("invalid configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("script is empty")]
    EmptyScript,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CadenceError>;
