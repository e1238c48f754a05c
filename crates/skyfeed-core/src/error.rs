//! Error types for skyfeed core decoding.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding commit data.
#[derive(Error, Debug)]
pub enum Error {
    /// CBOR decoding error.
    #[error("CBOR decode error: {0}")]
    Cbor(String),

    /// A content identifier could not be parsed.
    #[error("invalid CID: {0}")]
    InvalidCid(String),

    /// The CAR block section is malformed.
    #[error("invalid CAR: {0}")]
    InvalidCar(String),

    /// A decoded value has a missing or mistyped field.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl<T: std::fmt::Debug> From<ciborium::de::Error<T>> for Error {
    fn from(err: ciborium::de::Error<T>) -> Self {
        Error::Cbor(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "repo",
            reason: "expected text".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("repo"));
        assert!(msg.contains("expected text"));
    }

    #[test]
    fn test_invalid_car_display() {
        let err = Error::InvalidCar("truncated section".to_string());
        assert!(err.to_string().contains("invalid CAR"));
        assert!(err.to_string().contains("truncated section"));
    }

    #[test]
    fn test_from_cbor_error() {
        let bytes: &[u8] = &[0xff];
        let cbor_err = ciborium::from_reader::<ciborium::Value, _>(bytes).unwrap_err();
        let err: Error = cbor_err.into();
        assert!(matches!(err, Error::Cbor(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
