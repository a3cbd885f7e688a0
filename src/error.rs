//! Error taxonomy for vault access and the retrieval pipeline.
//!
//! Library code returns [`VaultError`]; the CLI and server wiring wrap it in
//! `anyhow` the same way the rest of the application does. Each variant maps
//! to a stable machine-readable [`code`](VaultError::code) used in tool error
//! envelopes.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Connection refused, reset, TLS failure, or a body that could not be read.
    #[error("transport error on {path}: {message}")]
    Transport { path: String, message: String },

    /// The selected timeout tier elapsed before a response arrived.
    #[error("request to {path} timed out after {}ms", .after.as_millis())]
    Timeout { path: String, after: Duration },

    /// Any non-2xx status that is not 403/404.
    #[error("unexpected status {status} for {path}")]
    Status { status: u16, path: String },

    /// The circuit breaker rejected the call without touching the network.
    #[error("backend unavailable: circuit open, retry in {}ms", .retry_in.as_millis())]
    CircuitOpen { retry_in: Duration },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Bad tool-surface input, rejected before any pipeline stage runs.
    #[error("invalid parameter: {0}")]
    Validation(String),

    #[error("token budget exceeded: {used} > {budget}")]
    BudgetExceeded { used: usize, budget: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("could not decode response from {path}: {message}")]
    Decode { path: String, message: String },
}

impl VaultError {
    /// Machine-readable code used in tool error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::Transport { .. } => "transport",
            VaultError::Timeout { .. } => "timeout",
            VaultError::Status { .. } => "bad_status",
            VaultError::CircuitOpen { .. } => "backend_unavailable",
            VaultError::NotFound(_) => "not_found",
            VaultError::Forbidden(_) => "forbidden",
            VaultError::Validation(_) => "bad_request",
            VaultError::BudgetExceeded { .. } => "budget_exceeded",
            VaultError::Cancelled => "cancelled",
            VaultError::Decode { .. } => "decode",
        }
    }

    /// Per-path failures that a walk or aggregation skips over.
    pub fn is_skippable(&self) -> bool {
        matches!(self, VaultError::NotFound(_) | VaultError::Forbidden(_))
    }

    /// Failures worth another attempt for idempotent requests.
    pub fn is_retryable(&self) -> bool {
        match self {
            VaultError::Transport { .. } | VaultError::Timeout { .. } => true,
            VaultError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Failures that count against the circuit breaker.
    ///
    /// Client errors (404, 403, validation) say nothing about backend health.
    pub fn counts_as_backend_failure(&self) -> bool {
        self.is_retryable()
    }

    /// Errors that end a whole query rather than degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VaultError::CircuitOpen { .. } | VaultError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skippable_kinds() {
        assert!(VaultError::NotFound("a.md".into()).is_skippable());
        assert!(VaultError::Forbidden("private/".into()).is_skippable());
        assert!(!VaultError::Cancelled.is_skippable());
    }

    #[test]
    fn test_retryable_statuses() {
        let server = VaultError::Status {
            status: 503,
            path: "x".into(),
        };
        let client = VaultError::Status {
            status: 400,
            path: "x".into(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!VaultError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_circuit_open_is_fatal_with_code() {
        let err = VaultError::CircuitOpen {
            retry_in: Duration::from_millis(1500),
        };
        assert!(err.is_fatal());
        assert_eq!(err.code(), "backend_unavailable");
        assert!(err.to_string().contains("1500ms"));
    }
}
