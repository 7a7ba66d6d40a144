//! Error types for remote task-list access.

use thiserror::Error;

/// Errors that can occur when talking to a remote task-list account.
#[derive(Debug, Error)]
pub enum TodoError {
    /// The remote could not be reached or did not answer in time.
    #[error("remote unreachable: {0}")]
    Connectivity(String),

    /// Authentication failed or no usable token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote answered with an error status.
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    /// The remote answered with something we could not interpret.
    #[error("invalid response: {0}")]
    Protocol(String),

    /// The addressed task or list does not exist remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// The account is not signed in.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing the token file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TodoError {
    /// True if retrying later may succeed, so the operation should be deferred.
    ///
    /// Server-side failures and throttling count as connectivity: the request
    /// itself was fine and the remote is just not accepting it right now.
    pub fn is_connectivity(&self) -> bool {
        match self {
            TodoError::Connectivity(_) => true,
            TodoError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TodoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
            TodoError::Connectivity(e.to_string())
        } else if e.is_decode() {
            TodoError::Protocol(e.to_string())
        } else if let Some(status) = e.status() {
            TodoError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            TodoError::Connectivity(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(TodoError::Connectivity("timed out".into()).is_connectivity());
        assert!(
            TodoError::Http {
                status: 503,
                message: "unavailable".into()
            }
            .is_connectivity()
        );
        assert!(
            TodoError::Http {
                status: 429,
                message: "slow down".into()
            }
            .is_connectivity()
        );
        assert!(
            !TodoError::Http {
                status: 400,
                message: "bad request".into()
            }
            .is_connectivity()
        );
        assert!(!TodoError::NotFound("task".into()).is_connectivity());
        assert!(!TodoError::Protocol("no id".into()).is_connectivity());
    }
}
