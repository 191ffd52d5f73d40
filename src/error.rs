use thiserror::Error;

/// Domain-level error kinds for the dubbing pipeline (spec §7).
#[derive(Error, Debug)]
pub enum DubError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("on-disk state corrupt: {0}")]
    Corrupt(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DubError {
    /// Stable short tag used in `status.json`'s `error.kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            DubError::InvalidRequest(_) => "InvalidRequest",
            DubError::Conflict(_) => "Conflict",
            DubError::EngineFailure(_) => "EngineFailure",
            DubError::NotFound(_) => "NotFound",
            DubError::Corrupt(_) => "Corrupt",
            DubError::Cancelled => "Cancelled",
            DubError::Config(_) => "Config",
            DubError::Io(_) => "IOFailure",
            DubError::Http(_) => "EngineFailure",
            DubError::Json(_) => "Corrupt",
        }
    }
}

pub type Result<T> = std::result::Result<T, DubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(DubError::Cancelled.kind(), "Cancelled");
        assert_eq!(DubError::Conflict("x".into()).kind(), "Conflict");
        assert_eq!(
            DubError::EngineFailure("boom".into()).kind(),
            "EngineFailure"
        );
    }
}
