use thiserror::Error;

/// Top-level error type for Tabula.
///
/// Subsystem crates define their own error types and convert into this one
/// at the composition root, so `?` works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TabulaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for TabulaError {
    fn from(err: toml::de::Error) -> Self {
        TabulaError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TabulaError {
    fn from(err: toml::ser::Error) -> Self {
        TabulaError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TabulaError {
    fn from(err: serde_json::Error) -> Self {
        TabulaError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Tabula operations.
pub type Result<T> = std::result::Result<T, TabulaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(TabulaError, &str)> = vec![
            (
                TabulaError::Config("bad key".to_string()),
                "Configuration error: bad key",
            ),
            (
                TabulaError::Storage("disk full".to_string()),
                "Storage error: disk full",
            ),
            (
                TabulaError::Api("bind failed".to_string()),
                "API error: bind failed",
            ),
            (
                TabulaError::Serialization("invalid json".to_string()),
                "Serialization error: invalid json",
            ),
            (TabulaError::ShuttingDown, "Shutdown in progress"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TabulaError = io_err.into();
        assert!(matches!(err, TabulaError::Io(_)));
        assert!(err.to_string().starts_with("I/O error:"));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: TabulaError = err.unwrap_err().into();
        assert!(matches!(err, TabulaError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: TabulaError = err.unwrap_err().into();
        assert!(matches!(err, TabulaError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(format!("got {}", value))
        }

        assert_eq!(inner().unwrap(), "got 42");
    }
}
