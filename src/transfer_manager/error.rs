//! Error taxonomy for the transfer engine.
//!
//! Every failure a transfer can observe collapses into [`TransferError`].
//! The machine-readable [`TransferErrorKind`] is what gets persisted on a
//! failed record; the full error carries the human-readable detail.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP status codes that are worth retrying.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Machine-readable error category, persisted on failed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferErrorKind {
    NetworkUnreachable,
    Transport,
    Authentication,
    ClientRestoration,
    Decomposition,
    Persistence,
    Canceled,
    InvalidState,
}

impl TransferErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferErrorKind::NetworkUnreachable => "network_unreachable",
            TransferErrorKind::Transport => "transport",
            TransferErrorKind::Authentication => "authentication",
            TransferErrorKind::ClientRestoration => "client_restoration",
            TransferErrorKind::Decomposition => "decomposition",
            TransferErrorKind::Persistence => "persistence",
            TransferErrorKind::Canceled => "canceled",
            TransferErrorKind::InvalidState => "invalid_state",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "network_unreachable" => Some(TransferErrorKind::NetworkUnreachable),
            "transport" => Some(TransferErrorKind::Transport),
            "authentication" => Some(TransferErrorKind::Authentication),
            "client_restoration" => Some(TransferErrorKind::ClientRestoration),
            "decomposition" => Some(TransferErrorKind::Decomposition),
            "persistence" => Some(TransferErrorKind::Persistence),
            "canceled" => Some(TransferErrorKind::Canceled),
            "invalid_state" => Some(TransferErrorKind::InvalidState),
            _ => None,
        }
    }
}

/// Errors produced by transfer operations and manager commands.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("network is unreachable")]
    NetworkUnreachable,

    #[error("transport failure: {message}")]
    Transport {
        status: Option<u16>,
        retryable: bool,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("no client available for restoration id '{0}'")]
    ClientRestoration(String),

    #[error("decomposition failed: {0}")]
    Decomposition(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("transfer canceled")]
    Canceled,

    #[error("invalid state for requested operation")]
    InvalidState,
}

impl TransferError {
    /// Build a transport error from an HTTP status, classifying retryability.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => TransferError::Authentication(message.into()),
            _ => TransferError::Transport {
                status: Some(status),
                retryable: RETRYABLE_STATUSES.contains(&status),
                message: message.into(),
            },
        }
    }

    pub fn kind(&self) -> TransferErrorKind {
        match self {
            TransferError::NetworkUnreachable => TransferErrorKind::NetworkUnreachable,
            TransferError::Transport { .. } => TransferErrorKind::Transport,
            TransferError::Authentication(_) => TransferErrorKind::Authentication,
            TransferError::ClientRestoration(_) => TransferErrorKind::ClientRestoration,
            TransferError::Decomposition(_) => TransferErrorKind::Decomposition,
            TransferError::Persistence(_) => TransferErrorKind::Persistence,
            TransferError::Canceled => TransferErrorKind::Canceled,
            TransferError::InvalidState => TransferErrorKind::InvalidState,
        }
    }

    /// Returns true if a work unit hitting this error should retry in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transport { retryable: true, .. })
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16());
        // Connection-level failures and timeouts have no status but are
        // transient; retry them.
        let retryable = match status {
            Some(code) => RETRYABLE_STATUSES.contains(&code),
            None => e.is_timeout() || e.is_connect() || e.is_request(),
        };
        TransferError::Transport {
            status,
            retryable,
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Transport {
            status: None,
            retryable: false,
            message: format!("i/o error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status_classification() {
        for status in RETRYABLE_STATUSES {
            let err = TransferError::from_status(status, "boom");
            assert!(err.is_retryable(), "status {} should be retryable", status);
        }

        assert!(!TransferError::from_status(404, "gone").is_retryable());
        assert!(!TransferError::from_status(400, "bad").is_retryable());
        assert!(!TransferError::from_status(409, "conflict").is_retryable());
    }

    #[test]
    fn test_auth_statuses_map_to_authentication() {
        assert_eq!(
            TransferError::from_status(401, "no").kind(),
            TransferErrorKind::Authentication
        );
        assert_eq!(
            TransferError::from_status(403, "no").kind(),
            TransferErrorKind::Authentication
        );
    }

    #[test]
    fn test_canceled_is_not_retryable() {
        assert!(!TransferError::Canceled.is_retryable());
        assert!(!TransferError::NetworkUnreachable.is_retryable());
        assert!(!TransferError::InvalidState.is_retryable());
    }

    #[test]
    fn test_kind_string_conversion() {
        for kind in [
            TransferErrorKind::NetworkUnreachable,
            TransferErrorKind::Transport,
            TransferErrorKind::Authentication,
            TransferErrorKind::ClientRestoration,
            TransferErrorKind::Decomposition,
            TransferErrorKind::Persistence,
            TransferErrorKind::Canceled,
            TransferErrorKind::InvalidState,
        ] {
            assert_eq!(TransferErrorKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(TransferErrorKind::from_str("nope"), None);
    }
}
