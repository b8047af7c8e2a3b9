//! Top-level error categories surfaced by the core, and their HTTP mapping.

use thiserror::Error;

use crate::backend::BackendError;
use crate::catalog::CatalogError;

/// Unified error type returned by lifecycle, data-plane, and tunnel code.
///
/// Every variant maps to exactly one row of the error-handling table: a
/// user-visible HTTP status via [`CoreError::status_code`], and never a body
/// that leaks a credential (`proxy_token`, `agent_token`, `tunnel_token`).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: {current}/{max}")]
    QuotaExceeded { current: u64, max: u64 },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("upstream proxy error: {0}")]
    ProxyError(String),
}

impl CoreError {
    /// The HTTP status code the data-plane/admin-API layer should respond with.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Unauthorized => 401,
            CoreError::Forbidden => 403,
            CoreError::NotFound => 404,
            CoreError::Conflict(_) => 409,
            CoreError::QuotaExceeded { .. } => 403,
            CoreError::BackendUnavailable(_) => 503,
            CoreError::BackendFailure(_) => 502,
            CoreError::Timeout(_) => 504,
            CoreError::ServiceUnavailable(_) => 503,
            CoreError::ProxyError(_) => 502,
        }
    }

    /// True when a 503 error page should auto-refresh (paused/offline/pod-not-ready).
    pub fn should_auto_refresh(&self) -> bool {
        matches!(self, CoreError::ServiceUnavailable(_))
    }
}

impl From<BackendError> for CoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => CoreError::BackendUnavailable(msg),
            BackendError::NotFound(_) => CoreError::NotFound,
            BackendError::Timeout(msg) => CoreError::Timeout(msg),
            BackendError::QuotaExceededAtBackend { current, max } => {
                CoreError::QuotaExceeded { current, max }
            }
            BackendError::Conflict(msg) => CoreError::Conflict(msg),
            BackendError::Unsupported(op) => {
                CoreError::BackendFailure(format!("operation not supported: {op}"))
            }
            BackendError::Other(err) => CoreError::BackendFailure(err.to_string()),
        }
    }
}

impl From<CatalogError> for CoreError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Conflict(field) => {
                CoreError::Conflict(format!("duplicate {field}"))
            }
            CatalogError::NotFound => CoreError::NotFound,
        }
    }
}
