//! Error types shared across brgy-health crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrgyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BrgyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = BrgyError::NotFound("patient record 42".into());
        assert_eq!(err.to_string(), "Not found: patient record 42");
    }

    #[test]
    fn test_io_error_converts() {
        fn read_missing() -> Result<String> {
            Ok(std::fs::read_to_string("/definitely/not/here/brgy.toml")?)
        }
        assert!(matches!(read_missing(), Err(BrgyError::Io(_))));
    }
}
