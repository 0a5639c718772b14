//! Error types for the result cache

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::error::{ErrorCode, SplitflowError};

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O operation failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Lease could not be acquired or released
    #[error("Lease error: {0}")]
    Lease(String),

    /// Lease held by someone else
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Entry present but unreadable
    #[error("Corrupted entry: {0}")]
    Corrupted(String),

    /// Gave up waiting on a foreign lease
    #[error("Timeout: operation took longer than {0:?}")]
    Timeout(Duration),
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serialization<E: fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }

    pub fn lease<E: fmt::Display>(msg: E) -> Self {
        Self::Lease(msg.to_string())
    }

    pub fn conflict<E: fmt::Display>(msg: E) -> Self {
        Self::Conflict(msg.to_string())
    }

    pub fn corrupted<E: fmt::Display>(msg: E) -> Self {
        Self::Corrupted(msg.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Lease(_) | Self::Timeout(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    fn path(&self) -> Option<PathBuf> {
        match self {
            Self::Io { path, .. } => Some(path.clone()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

impl From<CacheError> for SplitflowError {
    fn from(err: CacheError) -> Self {
        let code = match &err {
            CacheError::Io { .. } => ErrorCode::CACHE_IO_ERROR,
            CacheError::Serialization(_) => ErrorCode::CACHE_SERIALIZATION_ERROR,
            CacheError::Lease(_) => ErrorCode::CACHE_LEASE_FAILED,
            CacheError::Conflict(_) => ErrorCode::CACHE_LEASE_BUSY,
            CacheError::Corrupted(_) => ErrorCode::CACHE_CORRUPTED,
            CacheError::Timeout(_) => ErrorCode::CACHE_TIMEOUT,
        };
        let path = err.path();

        SplitflowError::cache_with_code(code, err.to_string(), path).with_source(err)
    }
}
