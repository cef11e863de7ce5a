use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors produced by the channel access layer and the analysis pipeline.
#[derive(Debug, Clone, Error)]
pub enum PsgError {
    /// Missing or malformed request parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The recording file is missing or could not be opened.
    #[error("recording {path} is unavailable: {reason}")]
    FileUnavailable { path: String, reason: String },

    /// A channel label that the recording does not contain.
    #[error("channel '{0}' not found")]
    ChannelNotFound(String),

    /// A sample or time window that exceeds the recording bounds.
    #[error("{channel}: range {start}..{end} exceeds {total} samples")]
    OutOfRange {
        channel: String,
        start: usize,
        end: usize,
        total: usize,
    },

    /// The EDF reader failed or produced data we cannot use.
    #[error("{message}")]
    Upstream { message: String, detail: String },

    #[error("time budget of {0:.0}s exceeded")]
    Timeout(f64),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification carried in every user-visible error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    OutOfRange,
    FileUnavailable,
    UpstreamFailure,
    PartialFailure,
    Timeout,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::FileUnavailable => "file_unavailable",
            ErrorKind::UpstreamFailure => "upstream_failure",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl PsgError {
    pub fn upstream(message: impl Into<String>, detail: impl fmt::Display) -> Self {
        PsgError::Upstream {
            message: message.into(),
            detail: detail.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        PsgError::InvalidArgument(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PsgError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PsgError::FileUnavailable { .. } => ErrorKind::FileUnavailable,
            PsgError::ChannelNotFound(_) => ErrorKind::NotFound,
            PsgError::OutOfRange { .. } => ErrorKind::OutOfRange,
            PsgError::Upstream { .. } => ErrorKind::UpstreamFailure,
            PsgError::Timeout(_) => ErrorKind::Timeout,
            PsgError::Cancelled => ErrorKind::Cancelled,
            PsgError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Errors the caller caused; these are never worth retrying.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument | ErrorKind::NotFound | ErrorKind::OutOfRange
        )
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from(self)
    }
}

/// Serializable error payload: kind, human readable message, and for
/// upstream failures the raw reader diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&PsgError> for ErrorReport {
    fn from(err: &PsgError) -> Self {
        let detail = match err {
            PsgError::Upstream { detail, .. } if !detail.is_empty() => Some(detail.clone()),
            PsgError::FileUnavailable { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            detail,
        }
    }
}

impl ErrorReport {
    /// Build a report for an error that only reached us as `anyhow` context.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(psg) = err.downcast_ref::<PsgError>() {
            return psg.report();
        }
        Self {
            kind: ErrorKind::Internal,
            message: err.to_string(),
            detail: Some(format!("{:#}", err)),
        }
    }
}

pub type PsgResult<T> = Result<T, PsgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_report_keeps_detail() {
        let err = PsgError::upstream("failed to read EDF block", "unexpected EOF");
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::UpstreamFailure);
        assert_eq!(report.detail.as_deref(), Some("unexpected EOF"));
        assert!(!err.is_caller_error());
    }

    #[test]
    fn channel_not_found_maps_to_not_found() {
        let err = PsgError::ChannelNotFound("Bogus".into());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_caller_error());
        let json = serde_json::to_value(err.report()).unwrap();
        assert_eq!(json["kind"], "not_found");
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn anyhow_wrapped_psg_error_is_recovered() {
        let err: anyhow::Error = PsgError::Timeout(600.0).into();
        let report = ErrorReport::from_anyhow(&err.context("running analysis"));
        assert_eq!(report.kind, ErrorKind::Timeout);
    }
}
