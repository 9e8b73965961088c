//! Error types for care-ops.

/// Top-level error type for the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("User {user_id} is not permitted to {action}")]
    PermissionDenied { action: String, user_id: i64 },
}

impl Error {
    /// Shorthand for a missing row, surfaced as a database not-found error.
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::Database(DatabaseError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a driver error raised by a write.
    ///
    /// SQLite reports constraint failures only through the message text, so
    /// anything mentioning a constraint becomes `Constraint`.
    pub fn from_write(context: &str, err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.to_ascii_lowercase().contains("constraint") {
            Self::Constraint(format!("{context}: {message}"))
        } else {
            Self::Query(format!("{context}: {message}"))
        }
    }
}

/// Input and workflow-gating errors. Always raised before any write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    MissingField { field: &'static str },

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Stage {stage} cannot be completed: {reason}")]
    GateNotMet { stage: u8, reason: &'static str },

    #[error("Stage {stage} cannot be completed before stage {required}")]
    StageOutOfOrder { stage: u8, required: u8 },

    #[error("Submission targets stage {submitted} but the record is at stage {current}")]
    WrongStage { submitted: u8, current: u8 },

    #[error("Onboarding {onboarding_id} is not ready for handoff: stage {missing} incomplete")]
    HandoffNotReady { onboarding_id: i64, missing: u8 },

    #[error("Onboarding {onboarding_id} has already been handed off")]
    AlreadyHandedOff { onboarding_id: i64 },
}

/// Result type alias for the core.
pub type Result<T> = std::result::Result<T, Error>;
