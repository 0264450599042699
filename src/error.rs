//! Error taxonomy visible at the pool boundary.
//!
//! Everything internal uses `anyhow`; this typed enum exists so the feed and
//! the runner can match on outcomes without string inspection.

use thiserror::Error;

use crate::objects::ActivationStatus;

#[derive(Debug, Error)]
pub enum ActivationError {
    /// Admission refused; the feed retries with backoff before giving up.
    #[error("system overloaded")]
    SystemOverloaded,

    /// Metadata lookup failed.
    #[error("action not found: {0}")]
    ActionNotFound(String),

    /// The container could not initialize user code.
    #[error("init failure: {0}")]
    InitFailure(String),

    /// User code returned an error result; the container stays warm.
    #[error("application error")]
    ApplicationError(serde_json::Value),

    /// Non-2xx from the run endpoint; the container is removed.
    #[error("developer error")]
    DeveloperError(serde_json::Value),

    /// The action exceeded its time limit; the container is removed.
    #[error("The action exceeded its time limit of {0} ms.")]
    Timeout(u64),

    /// Invariant breach or unclassified driver failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ActivationError {
    /// The record status this error classifies as.
    pub fn status(&self) -> ActivationStatus {
        match self {
            ActivationError::ApplicationError(_) => ActivationStatus::ApplicationError,
            ActivationError::ActionNotFound(_)
            | ActivationError::InitFailure(_)
            | ActivationError::DeveloperError(_) => ActivationStatus::DeveloperError,
            ActivationError::SystemOverloaded
            | ActivationError::Timeout(_)
            | ActivationError::Internal(_) => ActivationStatus::SystemError,
        }
    }

    /// The response body recorded for this error.
    pub fn response_body(&self) -> serde_json::Value {
        match self {
            ActivationError::ApplicationError(body) | ActivationError::DeveloperError(body) => {
                body.clone()
            }
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ActivationError::SystemOverloaded.status(),
            ActivationStatus::SystemError
        );
        assert_eq!(
            ActivationError::ActionNotFound("guest/missing".to_string()).status(),
            ActivationStatus::DeveloperError
        );
        assert_eq!(
            ActivationError::InitFailure("boom".to_string()).status(),
            ActivationStatus::DeveloperError
        );
        assert_eq!(
            ActivationError::ApplicationError(serde_json::json!({"error": "boom"})).status(),
            ActivationStatus::ApplicationError
        );
        assert_eq!(
            ActivationError::Timeout(1000).status(),
            ActivationStatus::SystemError
        );
    }

    #[test]
    fn test_error_body_wraps_message() {
        let body = ActivationError::Timeout(1000).response_body();
        assert!(body["error"].as_str().unwrap().contains("time limit"));
    }

    #[test]
    fn test_structured_bodies_pass_through() {
        let body = serde_json::json!({"error": "boom"});
        assert_eq!(
            ActivationError::ApplicationError(body.clone()).response_body(),
            body
        );
    }
}
