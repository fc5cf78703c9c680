use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[cfg(feature = "serde")]
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
