use thiserror::Error;

/// Error taxonomy shared across every control-plane component.
///
/// Components map their internal failures onto these variants at their
/// public boundary so callers (and the external API layer) see a stable,
/// small set of error kinds instead of each component's raw error type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Failed validation (IP/domain/email/port/identifier/nginx snippet).
    /// Rejected at the boundary; no state change has occurred.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint violation, or entity still referenced on delete.
    #[error("conflict: {0}")]
    Conflict(String),

    /// `nginx -t` returned non-zero.
    #[error("nginx config test failed: {0}")]
    NginxTestFailed(String),

    /// A child process, network call, or provider API failed.
    #[error("external failure: {0}")]
    ExternalFailure(String),

    /// Timeout or retryable I/O; caller may retry per component policy.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound("row not found".to_string())
            }
            other => EngineError::Internal(format!("store error: {other}")),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::ExternalFailure(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        let err = EngineError::NotFound("proxy 7".to_string());
        assert_eq!(err.to_string(), "not found: proxy 7");
    }

    #[test]
    fn sqlite_no_rows_maps_to_not_found() {
        let err: EngineError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
