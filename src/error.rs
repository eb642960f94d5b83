//! Error types for snowbridge.

use std::fmt;

use thiserror::Error;

use crate::bridge::BridgeError;

/// Normalized status code, derived from the SQLSTATE the bridge reports.
///
/// States that have no dedicated variant are kept verbatim in [`ErrorCode::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `08001` - client unable to establish connection
    UnableToConnect,
    /// `08003` - connection does not exist
    ConnectionDoesNotExist,
    /// `08004` - server rejected the connection
    ConnectionRejected,
    /// `08S01` - communication link failure
    CommunicationLinkFailure,
    /// Any other `08xxx` state
    ConnectionException,
    /// `22001`
    StringDataRightTruncated,
    /// `22003`
    NumericValueOutOfRange,
    /// `22007`
    InvalidDatetimeFormat,
    /// `22012`
    DivisionByZero,
    /// `22018`
    InvalidCharacterValueForCast,
    /// Any other `22xxx` state
    DataException,
    /// `23xxx`
    IntegrityConstraintViolation,
    /// `25000`
    InvalidTransactionState,
    /// `40001`
    SerializationFailure,
    /// Any other `40xxx` state
    TransactionRollback,
    /// `42000`
    SyntaxErrorOrAccessRuleViolation,
    /// `42S02`
    TableNotFound,
    /// `42S22`
    ColumnNotFound,
    /// `HY000`
    GeneralError,
    /// `HYT00`
    Timeout,
    /// `HYT01`
    ConnectionTimeout,
    /// Unmapped SQLSTATE (or a bridge-specific code)
    Other(String),
}

impl ErrorCode {
    /// Translate a SQLSTATE into a normalized code.
    pub fn from_sqlstate(state: &str) -> Self {
        let state = state.trim().to_ascii_uppercase();
        match state.as_str() {
            "08001" => Self::UnableToConnect,
            "08003" => Self::ConnectionDoesNotExist,
            "08004" => Self::ConnectionRejected,
            "08S01" => Self::CommunicationLinkFailure,
            "22001" => Self::StringDataRightTruncated,
            "22003" => Self::NumericValueOutOfRange,
            "22007" => Self::InvalidDatetimeFormat,
            "22012" => Self::DivisionByZero,
            "22018" => Self::InvalidCharacterValueForCast,
            "25000" => Self::InvalidTransactionState,
            "40001" => Self::SerializationFailure,
            "42000" => Self::SyntaxErrorOrAccessRuleViolation,
            "42S02" => Self::TableNotFound,
            "42S22" => Self::ColumnNotFound,
            "HY000" => Self::GeneralError,
            "HYT00" => Self::Timeout,
            "HYT01" => Self::ConnectionTimeout,
            s if s.starts_with("08") => Self::ConnectionException,
            s if s.starts_with("22") => Self::DataException,
            s if s.starts_with("23") => Self::IntegrityConstraintViolation,
            s if s.starts_with("40") => Self::TransactionRollback,
            _ => Self::Other(state),
        }
    }

    /// The canonical SQLSTATE for this code.
    pub fn sqlstate(&self) -> &str {
        match self {
            Self::UnableToConnect => "08001",
            Self::ConnectionDoesNotExist => "08003",
            Self::ConnectionRejected => "08004",
            Self::CommunicationLinkFailure => "08S01",
            Self::ConnectionException => "08000",
            Self::StringDataRightTruncated => "22001",
            Self::NumericValueOutOfRange => "22003",
            Self::InvalidDatetimeFormat => "22007",
            Self::DivisionByZero => "22012",
            Self::InvalidCharacterValueForCast => "22018",
            Self::DataException => "22000",
            Self::IntegrityConstraintViolation => "23000",
            Self::InvalidTransactionState => "25000",
            Self::SerializationFailure => "40001",
            Self::TransactionRollback => "40000",
            Self::SyntaxErrorOrAccessRuleViolation => "42000",
            Self::TableNotFound => "42S02",
            Self::ColumnNotFound => "42S22",
            Self::GeneralError => "HY000",
            Self::Timeout => "HYT00",
            Self::ConnectionTimeout => "HYT01",
            Self::Other(state) => state,
        }
    }

    /// Whether this code means the bridge handle can no longer be trusted.
    ///
    /// Timeouts count: the in-flight call cannot be interrupted, so the
    /// connection has to be torn down.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnableToConnect
                | Self::ConnectionDoesNotExist
                | Self::ConnectionRejected
                | Self::CommunicationLinkFailure
                | Self::ConnectionException
                | Self::Timeout
                | Self::ConnectionTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sqlstate())
    }
}

/// The main error type for snowbridge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The bridge handle could not be established or has been lost.
    #[error("Connection error [{code}]: {message}")]
    Connection { message: String, code: ErrorCode },

    /// The warehouse rejected a statement or its parameters.
    #[error("Statement error [{code}]: {message}")]
    Statement { message: String, code: ErrorCode },

    /// A value could not be translated to or from its host representation.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// A single-result call produced several result sets.
    #[error(
        "Statement returned {count} result sets; use a cursor (stream) to consume multiple results"
    )]
    MultipleResults { count: usize },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn connection(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::Connection {
            message: message.into(),
            code,
        }
    }

    pub fn statement(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::Statement {
            message: message.into(),
            code,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// The error returned by every operation on a disconnected protocol.
    pub fn disconnected() -> Self {
        Self::connection("not connected", ErrorCode::ConnectionDoesNotExist)
    }

    /// Classify a bridge failure into the error taxonomy.
    pub fn from_bridge(err: BridgeError) -> Self {
        let code = err
            .sqlstate
            .as_deref()
            .map(ErrorCode::from_sqlstate)
            .unwrap_or(ErrorCode::GeneralError);
        if code.is_connection_fatal() {
            Self::Connection {
                message: err.message,
                code,
            }
        } else {
            Self::Statement {
                message: err.message,
                code,
            }
        }
    }

    /// The normalized status code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection { code, .. } | Self::Statement { code, .. } => code.clone(),
            Self::Decode { .. } => ErrorCode::InvalidCharacterValueForCast,
            Self::MultipleResults { .. } | Self::Config(_) | Self::Io(_) => {
                ErrorCode::GeneralError
            }
        }
    }

    /// Whether the connection that produced this error must be discarded.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

impl From<BridgeError> for Error {
    fn from(err: BridgeError) -> Self {
        Self::from_bridge(err)
    }
}

/// Result type alias for snowbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::statement("SQL compilation error", ErrorCode::from_sqlstate("42000"));
        assert_eq!(
            err.to_string(),
            "Statement error [42000]: SQL compilation error"
        );
    }

    #[test]
    fn test_sqlstate_classes() {
        assert_eq!(ErrorCode::from_sqlstate("08s01"), ErrorCode::CommunicationLinkFailure);
        assert_eq!(ErrorCode::from_sqlstate("08007"), ErrorCode::ConnectionException);
        assert_eq!(ErrorCode::from_sqlstate("22P02"), ErrorCode::DataException);
        assert_eq!(ErrorCode::from_sqlstate("23505"), ErrorCode::IntegrityConstraintViolation);
        assert_eq!(ErrorCode::from_sqlstate("40P01"), ErrorCode::TransactionRollback);
        assert_eq!(ErrorCode::from_sqlstate("57014"), ErrorCode::Other("57014".to_string()));
        assert_eq!(ErrorCode::from_sqlstate("57014").sqlstate(), "57014");
    }

    #[test]
    fn test_bridge_classification() {
        let lost = Error::from_bridge(BridgeError::new("link down").with_sqlstate("08S01"));
        assert!(lost.is_connection_error());

        let timeout = Error::from_bridge(BridgeError::new("timed out").with_sqlstate("HYT00"));
        assert!(timeout.is_connection_error());

        let rejected = Error::from_bridge(BridgeError::new("syntax").with_sqlstate("42000"));
        assert!(!rejected.is_connection_error());
        assert_eq!(rejected.code(), ErrorCode::SyntaxErrorOrAccessRuleViolation);

        let unknown = Error::from_bridge(BridgeError::new("boom"));
        assert_eq!(unknown.code(), ErrorCode::GeneralError);
    }
}
