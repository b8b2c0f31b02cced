//! Error types and handling for the memory service

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type alias for memory service operations
pub type Result<T> = std::result::Result<T, FamError>;

/// Machine-checkable classification of a [`FamError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NameCollision,
    NotFound,
    OutOfSpace,
    InvalidRange,
    InvalidIndex,
    RangeMismatch,
    NotOwner,
    InvalidState,
    UnsupportedOperation,
    Timeout,
    AggregateFailure,
    InvalidParameter,
    PermissionDenied,
    Io,
    Serialization,
}

/// One failed non-blocking operation, as reported by a fence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// Issue sequence number within the owning context
    pub sequence: u64,
    /// Kind of the underlying error
    pub kind: ErrorKind,
    /// Rendered error message
    pub message: String,
}

impl OperationFailure {
    /// Capture the kind and message of an error for later aggregation
    pub fn from_error(sequence: u64, error: &FamError) -> Self {
        Self {
            sequence,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?}: {}", self.sequence, self.kind, self.message)
    }
}

/// Error type for every memory service operation
#[derive(Debug, thiserror::Error)]
pub enum FamError {
    /// A region or backup with this name already exists
    #[error("Name collision: {name}")]
    NameCollision { name: String },

    /// Missing region, dataitem, registration or backup
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Allocation cannot be satisfied
    #[error("Out of space: requested {requested}, available {available}")]
    OutOfSpace { requested: u64, available: u64 },

    /// Operation addresses bytes outside its target
    #[error("Invalid range: {message}")]
    InvalidRange { message: String },

    /// Indexed batch contains an index outside its target
    #[error("Invalid index {index} at position {position}: {message}")]
    InvalidIndex {
        position: usize,
        index: u64,
        message: String,
    },

    /// Copy size or stripe accounting is inconsistent
    #[error("Range mismatch: {message}")]
    RangeMismatch { message: String },

    /// Caller does not hold the resource it tried to release
    #[error("Not owner: {message}")]
    NotOwner { message: String },

    /// Operation on a closed or destroyed handle
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Operation meaningless in the current deployment
    #[error("Unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    /// Bounded wait expired
    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// One or more non-blocking operations failed before a fence completed
    #[error("{} operation(s) failed before the fence completed", .failures.len())]
    AggregateFailure { failures: Vec<OperationFailure> },

    /// Malformed argument
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Permission mode does not grant the requested access
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// Backing file or backup storage failure
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Metadata or address list encoding failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl FamError {
    /// Kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NameCollision { .. } => ErrorKind::NameCollision,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            Self::InvalidRange { .. } => ErrorKind::InvalidRange,
            Self::InvalidIndex { .. } => ErrorKind::InvalidIndex,
            Self::RangeMismatch { .. } => ErrorKind::RangeMismatch,
            Self::NotOwner { .. } => ErrorKind::NotOwner,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::AggregateFailure { .. } => ErrorKind::AggregateFailure,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Io { .. } => ErrorKind::Io,
            Self::Serialization { .. } => ErrorKind::Serialization,
        }
    }

    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    pub fn name_collision(name: impl Into<String>) -> Self {
        Self::NameCollision { name: name.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn out_of_space(requested: u64, available: u64) -> Self {
        Self::OutOfSpace {
            requested,
            available,
        }
    }

    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::InvalidRange {
            message: message.into(),
        }
    }

    pub fn invalid_index(position: usize, index: u64, message: impl Into<String>) -> Self {
        Self::InvalidIndex {
            position,
            index,
            message: message.into(),
        }
    }

    pub fn range_mismatch(message: impl Into<String>) -> Self {
        Self::RangeMismatch {
            message: message.into(),
        }
    }

    pub fn not_owner(message: impl Into<String>) -> Self {
        Self::NotOwner {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Individual failures carried by an aggregate error
    pub fn failures(&self) -> &[OperationFailure] {
        match self {
            Self::AggregateFailure { failures } => failures,
            _ => &[],
        }
    }
}

impl From<std::io::Error> for FamError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<bincode::Error> for FamError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(format!("Bincode error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = FamError::name_collision("myRegion");
        assert_eq!(err.kind(), ErrorKind::NameCollision);

        let err = FamError::out_of_space(1024, 512);
        assert_eq!(err.kind(), ErrorKind::OutOfSpace);

        let err = FamError::invalid_index(3, 99, "beyond extent");
        assert_eq!(err.kind(), ErrorKind::InvalidIndex);
    }

    #[test]
    fn test_aggregate_failure_display() {
        let failures = vec![
            OperationFailure::from_error(1, &FamError::invalid_range("past end")),
            OperationFailure::from_error(4, &FamError::not_found("dataitem")),
        ];
        let err = FamError::AggregateFailure { failures };
        assert_eq!(err.kind(), ErrorKind::AggregateFailure);
        assert_eq!(err.failures().len(), 2);
        assert!(err.to_string().contains("2 operation(s) failed"));
        assert_eq!(err.failures()[1].kind, ErrorKind::NotFound);
    }
}
