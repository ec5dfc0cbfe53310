use thiserror::Error;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An argument or option was rejected before reaching the store
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Error serializing or deserializing job data
    #[error("failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from the database
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The job tables have not been created in the configured schema
    #[error("schema `{schema}` is not installed")]
    NotInstalled {
        /// The configured schema name
        schema: String,
    },

    /// The installed tables were created by an incompatible version
    #[error("schema `{schema}` is at version {found}, expected version {expected}")]
    VersionMismatch {
        /// The configured schema name
        schema: String,
        /// Version recorded in the schema
        found: i32,
        /// Version this crate creates
        expected: i32,
    },
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
