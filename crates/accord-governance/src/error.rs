//! Error types for the governance core.
//!
//! Every variant maps onto one of five kinds ([`ErrorKind`]) that a transport
//! layer can translate into its own status signals.

use serde::Serialize;
use thiserror::Error;

/// The named outcome classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A referenced definition, instance, property, assignment or rule does not exist.
    NotFound,
    /// A value or input failed its declared type, range, pattern or required constraint.
    ValidationError,
    /// A retirement was attempted while dependents still reference the target.
    DependencyConflict,
    /// A uniqueness invariant or optimistic-concurrency check was violated.
    Conflict,
    /// A rule condition or action raised an unexpected error.
    Failed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::ValidationError => write!(f, "validation_error"),
            Self::DependencyConflict => write!(f, "dependency_conflict"),
            Self::Conflict => write!(f, "conflict"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Name of the field or property that failed.
    pub field: String,
    /// Description of the failure.
    pub message: String,
}

impl FieldError {
    /// Create a new field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors raised by the schema registry, attribute store, ledger and rule engine.
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// The referenced record does not exist (or is retired).
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record that was looked up.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Input failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// One or more fields failed validation.
    #[error("Validation failed: {}", join_field_errors(.0))]
    ValidationFailed(Vec<FieldError>),

    /// A rule condition could not be parsed.
    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    /// The record still has dependents and cannot be retired.
    #[error("Cannot retire {entity} {id}: {dependents} {dependent} still reference it")]
    DependencyConflict {
        /// Kind of record being retired.
        entity: &'static str,
        /// Identifier of the record being retired.
        id: String,
        /// Number of live dependents found.
        dependents: usize,
        /// Kind of the dependents.
        dependent: &'static str,
    },

    /// A definition with this name already exists in scope.
    #[error("Name already exists: {0}")]
    NameExists(String),

    /// An active assignment for the same user/role/system triple already exists.
    #[error("Active assignment already exists for user {user_id}, role {role_id}, system {target_system_id}")]
    DuplicateActiveAssignment {
        /// User instance.
        user_id: String,
        /// Role instance.
        role_id: String,
        /// Target integration system.
        target_system_id: String,
    },

    /// Generic uniqueness violation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A write was attempted against a stale version token.
    #[error("Stale write to {entity} {id}: expected version {expected}, found {actual}")]
    VersionMismatch {
        /// Kind of record written.
        entity: &'static str,
        /// Identifier of the record written.
        id: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// Rule condition or action execution failed.
    #[error("Execution failed: {0}")]
    Failed(String),

    /// Snapshot serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl GovernanceError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// The outcome class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) | Self::ValidationFailed(_) | Self::InvalidCondition(_) => {
                ErrorKind::ValidationError
            }
            Self::DependencyConflict { .. } => ErrorKind::DependencyConflict,
            Self::NameExists(_)
            | Self::DuplicateActiveAssignment { .. }
            | Self::Conflict(_)
            | Self::VersionMismatch { .. } => ErrorKind::Conflict,
            Self::Failed(_) | Self::Serialization(_) => ErrorKind::Failed,
        }
    }

    /// Whether an internal retry may succeed (lost optimistic-concurrency race).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}

/// Convenience Result type for the governance core.
pub type Result<T> = std::result::Result<T, GovernanceError>;
