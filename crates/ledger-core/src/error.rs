//! Error types for the block store.
use std::fmt;

use thiserror::Error;

/// Errors surfaced by every store, import and fetch operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("not found: {0}")] NotFound(String),
    #[error("duplicate block: {0}")] DuplicateBlock(String),
    #[error("invalid linkage: block {block} references unknown parent {parent}")] InvalidLinkage { block: String, parent: String },
    #[error("service stopped")] ServiceStopped,
    #[error("storage: {0}")] Storage(String),
}

impl ChainError {
    /// Status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::DuplicateBlock(_) => ErrorCode::DuplicateBlock,
            Self::InvalidLinkage { .. } => ErrorCode::InvalidLinkage,
            Self::ServiceStopped => ErrorCode::ServiceStopped,
            Self::Storage(_) => ErrorCode::StorageFailure,
        }
    }

    pub(crate) fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

/// Flat status codes for consumers that want `(code, payload)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    NotFound,
    DuplicateBlock,
    InvalidLinkage,
    ServiceStopped,
    StorageFailure,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::DuplicateBlock => "duplicate_block",
            Self::InvalidLinkage => "invalid_linkage",
            Self::ServiceStopped => "service_stopped",
            Self::StorageFailure => "storage_failure",
        };
        f.write_str(name)
    }
}

/// Malformed stealth prefix.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrefixError {
    #[error("prefix too long: {len} bits > {max}")] TooLong { len: usize, max: usize },
    #[error("invalid prefix digit: {0}")] InvalidDigit(char),
}
