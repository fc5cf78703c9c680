use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Model error: {0}")]
    Model(#[from] galvan_model::ModelError),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A state transition the store refuses, e.g. acknowledging a closed
    /// alarm. No state changes when this is returned.
    #[error("Logic violation: {0}")]
    LogicViolation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the batch writer should retry with backoff rather than give
    /// the batch to the overflow exporter.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Transient(_) => true,
            CoreError::Io(_) => true,
            CoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
