use rust_decimal::Decimal;
use thiserror::Error;

use crate::assist::AssistError;

#[derive(Debug, Error)]
pub enum SuprimentoError {
    #[error("Concurrency conflict on {entity}: expected status {expected}, found {actual}")]
    ConcurrencyConflict {
        entity: String,
        expected: String,
        actual: String,
    },

    #[error("Unauthorized: role {role} may not {action}")]
    Unauthorized { role: String, action: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Receipt required for {0}")]
    MissingRequiredReceipt(String),

    #[error("Document already signed: {0}")]
    AlreadySigned(String),

    #[error("{entity} already exists")]
    AlreadyExists { entity: String },

    #[error("Residual balance of {balance} requires a GDR before submission")]
    ResidualBalanceRequiresGdr { balance: Decimal },

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, SuprimentoError>;

impl SuprimentoError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    /// Classifies the error for propagation decisions.
    pub fn kind(&self) -> FailureKind {
        match self {
            SuprimentoError::NetworkFailure(_)
            | SuprimentoError::Io(_)
            | SuprimentoError::Json(_)
            | SuprimentoError::Toml(_) => FailureKind::System,
            _ => FailureKind::Business,
        }
    }

    /// The caller's view of the entity is stale and must be fetched again.
    pub fn requires_refetch(&self) -> bool {
        matches!(self, SuprimentoError::ConcurrencyConflict { .. })
    }

    /// Errors that block the user's action and revert optimistic state.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, SuprimentoError::NetworkFailure(_))
    }
}

impl From<AssistError> for SuprimentoError {
    fn from(err: AssistError) -> Self {
        SuprimentoError::NetworkFailure(err.to_string())
    }
}

/// Classifies a failure for retry and messaging decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Rule violation (validation, authorization, idempotency, stale status)
    Business,
    /// Infrastructure failure (collaborator unreachable, disk, decoding)
    System,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business => write!(f, "Business"),
            FailureKind::System => write!(f, "System"),
        }
    }
}
