//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only: rejected transitions, missing
/// references, conflicting state. Storage and transport failures belong to
/// the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The requested state change is not reachable from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The state moved underneath the caller (e.g. already advanced).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Only the most recent ledger entry of a product may be undone.
    #[error("not the latest movement: {0}")]
    NotLatest(String),

    /// A move targeted the slot the product already occupies.
    #[error("product is already at the target location")]
    SameLocation,

    /// A move targeted a slot that does not exist.
    #[error("location not found: {0}")]
    LocationNotFound(String),

    /// Bundle siblings are missing or have diverged; needs manual reconciliation.
    #[error("bundle inconsistent: {0}")]
    BundleInconsistent(String),

    /// A value failed validation (malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Authorization failure at the domain boundary.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl DomainError {
    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_latest(msg: impl Into<String>) -> Self {
        Self::NotLatest(msg.into())
    }

    pub fn location_not_found(what: impl Into<String>) -> Self {
        Self::LocationNotFound(what.into())
    }

    pub fn bundle_inconsistent(msg: impl Into<String>) -> Self {
        Self::BundleInconsistent(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Errors caused by concurrent mutation rather than bad input.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::NotLatest(_))
    }
}
