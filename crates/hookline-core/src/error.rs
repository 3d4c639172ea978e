//! Error types for init payload decoding and model validation.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for model decoding and validation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Init payload is structurally valid but semantically unusable.
    #[error("invalid init data: {0}")]
    InvalidInitData(String),

    /// Init payload could not be decoded.
    #[error("malformed init payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Creates an invalid init data error.
    pub fn invalid_init(message: impl Into<String>) -> Self {
        Self::InvalidInitData(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_init_display_names_field() {
        let error = CoreError::invalid_init("subscriber_name must not be empty");
        assert_eq!(error.to_string(), "invalid init data: subscriber_name must not be empty");
    }

    #[test]
    fn serde_errors_convert() {
        let Err(source) = serde_json::from_slice::<serde_json::Value>(b"{") else {
            unreachable!("truncated json must not parse");
        };
        let error = CoreError::from(source);
        assert!(error.to_string().starts_with("malformed init payload"));
    }
}
