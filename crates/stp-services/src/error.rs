use stp_runtime::ScopeError;

/// Errors returned by service façades.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The underlying call failed.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// An argument was rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The browser does not offer the requested action.
    #[error("the requested action is not supported: {0}")]
    UnsupportedAction(String),
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Scope(ScopeError::Json(err))
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
