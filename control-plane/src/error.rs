//! Re-exports the shared error taxonomy and adds `From` impls for
//! the external-facing dependencies this crate talks to that
//! `control-plane-types` doesn't define conversions for (HTTP client,
//! config loader).

pub use control_plane_types::error::{EngineError, Result};

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::ExternalFailure(format!("http request failed: {err}"))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Internal(format!("config error: {err}"))
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Internal(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_conversions_land_in_internal() {
        let err: EngineError = "boom".into();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
