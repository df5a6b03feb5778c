use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Selector syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TetherError {
    /// Whether this error was raised by the integrity layer (as opposed to the backend or I/O).
    pub fn is_integrity(&self) -> bool {
        matches!(self, TetherError::ReferentialIntegrity(_))
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
