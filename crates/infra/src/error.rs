//! Infrastructure error taxonomy.
//!
//! | source | type | notes |
//! |---|---|---|
//! | persistence | `StoreError` | `Conflict` is the only retryable variant |
//! | domain rules | `DomainError` (wrapped) | never retried |
//! | role check | `DispatchError::Forbidden` | raised before any IO |
//! | carrier lookups | `CarrierError` | isolated per reconciled item |

use thiserror::Error;

use depotflow_auth::AuthzError;
use depotflow_core::DomainError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency failure or unique-key race.
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
    /// A persisted row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Forbidden(#[from] AuthzError),
}

impl DispatchError {
    /// Whether a fresh attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Store(StoreError::Conflict(_)))
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            DispatchError::Domain(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CarrierError {
    #[error("carrier lookup timed out after {0} ms")]
    Timeout(u64),
    #[error("carrier transport error: {0}")]
    Transport(String),
    /// The carrier answered with a non-success status.
    #[error("carrier rejected lookup ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("carrier response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {name} is required")]
    Missing { name: &'static str },
    #[error("environment variable {name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}
