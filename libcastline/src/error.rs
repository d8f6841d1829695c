//! Error types for Castline

use thiserror::Error;

use crate::types::CastStatus;

pub type Result<T> = std::result::Result<T, CastlineError>;

#[derive(Error, Debug)]
pub enum CastlineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cast not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for cast {cast_id}: {from} -> {to}")]
    InvalidTransition {
        cast_id: String,
        from: CastStatus,
        to: CastStatus,
    },
}

impl CastlineError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CastlineError::InvalidInput(_)
            | CastlineError::NotFound(_)
            | CastlineError::InvalidTransition { .. } => 3,
            CastlineError::Config(_) | CastlineError::Database(_) => 2,
            CastlineError::Publish(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Failure reported by a network publisher.
///
/// Every variant moves a claimed cast to `failed`. Only `Network` and
/// `RateLimited` are retried inside a single publish attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rejected by network: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Publish timed out after {0}s")]
    Timeout(u64),

    #[error("Precondition not met: {0}")]
    Precondition(String),
}

impl PublishError {
    /// Whether the same request may succeed if sent again shortly.
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Network(_) | PublishError::RateLimited(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CastlineError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_not_found() {
        let error = CastlineError::NotFound("abc".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_config_and_database() {
        let config = CastlineError::Config(ConfigError::MissingField("database.path".into()));
        assert_eq!(config.exit_code(), 2);

        let db = CastlineError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        )));
        assert_eq!(db.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_publish_error() {
        let error = CastlineError::Publish(PublishError::Network("reset".into()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_invalid_transition_formatting() {
        let error = CastlineError::InvalidTransition {
            cast_id: "c1".to_string(),
            from: CastStatus::Published,
            to: CastStatus::Scheduled,
        };
        assert_eq!(
            error.to_string(),
            "Invalid transition for cast c1: published -> scheduled"
        );
    }

    #[test]
    fn test_publish_error_formatting() {
        assert_eq!(
            PublishError::Network("connection refused".into()).to_string(),
            "Network error: connection refused"
        );
        assert_eq!(
            PublishError::Timeout(30).to_string(),
            "Publish timed out after 30s"
        );
        assert_eq!(
            PublishError::Rejected("text too long".into()).to_string(),
            "Rejected by network: text too long"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PublishError::Network("x".into()).is_transient());
        assert!(PublishError::RateLimited("x".into()).is_transient());
        assert!(!PublishError::Authentication("x".into()).is_transient());
        assert!(!PublishError::Rejected("x".into()).is_transient());
        assert!(!PublishError::Precondition("x".into()).is_transient());
        // A timed-out call may already have reached the network
        assert!(!PublishError::Timeout(30).is_transient());
    }

    #[test]
    fn test_error_conversion_from_publish_error() {
        let error: CastlineError = PublishError::Rejected("nope".into()).into();
        match error {
            CastlineError::Publish(PublishError::Rejected(msg)) => assert_eq!(msg, "nope"),
            other => panic!("Expected CastlineError::Publish, got {:?}", other),
        }
    }

    #[test]
    fn test_config_error_read_error_formatting() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let config_error = ConfigError::ReadError(io_error);
        assert!(config_error.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_error_chain_preserves_context() {
        let error: CastlineError =
            PublishError::Network("relay unreachable (publish)".into()).into();
        let message = error.to_string();
        assert!(message.contains("Publish error"));
        assert!(message.contains("relay unreachable"));
    }
}
