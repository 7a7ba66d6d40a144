//! Errors reported to clients of the service.

use nudge_sync::SyncError;
use nudge_todo::TodoError;
use thiserror::Error;

/// Errors a request can fail with.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed and nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The request targets an unknown reminder, list or account.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote could not be reached.
    #[error("remote unreachable: {0}")]
    Connectivity(String),

    /// A local write failed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// The remote rejected the request.
    #[error("remote error: {0}")]
    Remote(String),

    /// The service has stopped.
    #[error("service is shut down")]
    Shutdown,
}

impl From<SyncError> for ServiceError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Remote(e) => e.into(),
            SyncError::Persistence { .. } => ServiceError::Persistence(err.to_string()),
            SyncError::NotFound(what) => ServiceError::NotFound(what),
            SyncError::Validation(message) => ServiceError::Validation(message),
            SyncError::Rule(e) => ServiceError::Validation(e.to_string()),
        }
    }
}

impl From<TodoError> for ServiceError {
    fn from(err: TodoError) -> Self {
        if err.is_connectivity() {
            return ServiceError::Connectivity(err.to_string());
        }
        match err {
            TodoError::UnknownAccount(user) => ServiceError::NotFound(format!("account {user}")),
            TodoError::NotFound(what) => ServiceError::NotFound(what),
            other => ServiceError::Remote(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_is_preserved() {
        let err: ServiceError =
            SyncError::Remote(TodoError::Connectivity("down".to_string())).into();
        assert!(matches!(err, ServiceError::Connectivity(_)));

        let err: ServiceError = TodoError::Http {
            status: 503,
            message: "busy".to_string(),
        }
        .into();
        assert!(matches!(err, ServiceError::Connectivity(_)));
    }

    #[test]
    fn test_remote_rejections_map_to_remote() {
        let err: ServiceError = TodoError::Http {
            status: 400,
            message: "bad".to_string(),
        }
        .into();
        assert!(matches!(err, ServiceError::Remote(_)));

        let err: ServiceError = TodoError::UnknownAccount("u9".to_string()).into();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
