use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Whether a failed remote call is worth repeating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Connect,
    Timeout,
    RateLimited,
    Unavailable,
    Auth,
    Validation,
    NotFound,
    Conflict,
    Decode,
}

impl RemoteErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            Self::Connect | Self::Timeout | Self::RateLimited | Self::Unavailable => {
                ErrorClass::Transient
            }
            Self::Auth | Self::Validation | Self::NotFound | Self::Conflict | Self::Decode => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Decode => "decode",
        }
    }

    /// Maps an HTTP status returned by the backend.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            404 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::Unavailable,
            _ => Self::Validation,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a remote store call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("remote {kind} failure: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, message: message.into() }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Errors surfaced by the data-access layer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("connection failure for scope `{scope}`: {message}")]
    Connection { scope: String, message: String },
    #[error("connection pool for scope `{scope}` exhausted after waiting {waited_ms}ms")]
    PoolExhausted { scope: String, waited_ms: u64 },
    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: RemoteError },
    #[error("permanent failure: {0}")]
    Permanent(RemoteError),
    #[error("batch finished with {failed} failed and {succeeded} succeeded items")]
    PartialBatchFailure { succeeded: usize, failed: usize },
    #[error("data layer malfunction: {0}")]
    Internal(String),
}

impl DataError {
    /// Technical description for logs.
    pub fn detail(&self) -> String {
        self.to_string()
    }

    /// Short message that is safe to show to an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Connection { .. } | Self::RetryExhausted { .. } => {
                "The data service is temporarily unavailable. Please try again shortly."
            }
            Self::PoolExhausted { .. } => "The system is busy right now. Please try again shortly.",
            Self::Permanent(error) => match error.kind {
                RemoteErrorKind::Auth => "You are not authorized to access this record.",
                RemoteErrorKind::NotFound => "The requested record could not be found.",
                RemoteErrorKind::Validation | RemoteErrorKind::Conflict => {
                    "The data provided was rejected. Please check it and try again."
                }
                _ => "The request could not be completed. Please try again.",
            },
            Self::PartialBatchFailure { .. } => {
                "Some items could not be processed. Review the failed items and try again."
            }
            Self::Internal(_) => "An unexpected internal error occurred.",
        }
    }

    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::RetryExhausted { last, .. } => Some(last),
            Self::Permanent(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl DataError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<DataError> for InterfaceError {
    fn from(value: DataError) -> Self {
        let message = value.detail();
        match value {
            DataError::Permanent(_) | DataError::PartialBatchFailure { .. } => {
                Self::BadRequest { message, correlation_id: "unassigned".to_owned() }
            }
            DataError::Connection { .. }
            | DataError::PoolExhausted { .. }
            | DataError::RetryExhausted { .. } => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            DataError::Internal(_) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{DataError, ErrorClass, InterfaceError, RemoteError, RemoteErrorKind};

    #[test]
    fn http_statuses_classify_into_transient_and_permanent() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert_eq!(RemoteError::from_status(status, "x").class(), ErrorClass::Transient);
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert_eq!(RemoteError::from_status(status, "x").class(), ErrorClass::Permanent);
        }
        assert!(RemoteError::new(RemoteErrorKind::Connect, "refused").is_transient());
    }

    #[test]
    fn permanent_error_maps_to_bad_request_interface_error() {
        let interface = DataError::Permanent(RemoteError::from_status(422, "amount is required"))
            .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn retry_exhaustion_maps_to_service_unavailable() {
        let error = DataError::RetryExhausted {
            attempts: 4,
            last: RemoteError::from_status(503, "upstream unavailable"),
        };
        assert!(error.detail().contains("4 attempts"));
        assert_eq!(
            error.user_message(),
            "The data service is temporarily unavailable. Please try again shortly."
        );

        let interface = error.into_interface("req-2");
        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn permanent_user_messages_depend_on_remote_kind() {
        let auth = DataError::Permanent(RemoteError::from_status(401, "jwt expired"));
        let missing = DataError::Permanent(RemoteError::from_status(404, "no rows"));

        assert_eq!(auth.user_message(), "You are not authorized to access this record.");
        assert_eq!(missing.user_message(), "The requested record could not be found.");
        assert!(!auth.user_message().contains("jwt"));
    }

    #[test]
    fn internal_error_maps_to_internal() {
        let interface = DataError::Internal("cache lock poisoned".to_owned()).into_interface("req-3");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}
