use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("download failed for {url}: {detail}")]
    DownloadFailed { url: String, detail: String },

    #[error("{tool} timed out after {seconds}s")]
    ProcessTimeout { tool: String, seconds: u64 },

    #[error("caption parse error: {0}")]
    Parse(String),

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("operation canceled")]
    Canceled,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("{0}")]
    Unknown(String),
}

/// Coarse failure category reported to requesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DownloadFailed,
    ProcessTimeout,
    ParseError,
    NotFound,
    Canceled,
    Unknown,
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::ExternalToolMissing { .. }
            | EngineError::ExternalToolFailed { .. }
            | EngineError::DownloadFailed { .. } => FailureKind::DownloadFailed,
            EngineError::ProcessTimeout { .. } => FailureKind::ProcessTimeout,
            EngineError::Parse(_) | EngineError::Json(_) => FailureKind::ParseError,
            EngineError::NotFound(_) => FailureKind::NotFound,
            EngineError::Canceled => FailureKind::Canceled,
            EngineError::Io(_) | EngineError::InvalidSettings(_) | EngineError::Unknown(_) => {
                FailureKind::Unknown
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
