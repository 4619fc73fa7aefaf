use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LdError>;

/// Errors raised while building, opening, or querying an LD matrix.
///
/// `UnknownVariant` is the only recoverable kind: callers treat it as "no data".
/// Everything else is either an I/O failure, a corrupt file, or a programming error.
#[derive(Error, Debug)]
pub enum LdError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Variant '{0}' is not present in the variant index.")]
    UnknownVariant(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unsupported or corrupt LD matrix file: {0}")]
    Format(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl LdError {
    /// Returns true for errors that callers may treat as an absent result.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LdError::UnknownVariant(_))
    }
}

impl From<toml::de::Error> for LdError {
    fn from(err: toml::de::Error) -> Self {
        LdError::Config(format!("Failed to parse TOML configuration: {err}"))
    }
}

impl From<toml::ser::Error> for LdError {
    fn from(err: toml::ser::Error) -> Self {
        LdError::Config(format!("Failed to serialize configuration to TOML: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unknown_variant_is_recoverable() {
        assert!(LdError::UnknownVariant("rs1".into()).is_recoverable());
        assert!(!LdError::InvalidArgument("x".into()).is_recoverable());
        assert!(!LdError::Compression("x".into()).is_recoverable());
    }

    #[test]
    fn io_errors_convert_and_render() {
        let err: LdError = io::Error::new(io::ErrorKind::NotFound, "missing.tld").into();
        assert!(matches!(err, LdError::Io(_)));
        assert!(err.to_string().contains("missing.tld"));
    }
}
