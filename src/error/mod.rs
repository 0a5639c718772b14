use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

pub mod codes;
pub mod helpers;

pub use codes::{describe_error_code, ErrorCode};

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// The unified error type for splitflow
#[derive(Error, Debug)]
pub enum SplitflowError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Configuration {
        code: u16,
        message: String,
        field: Option<String>,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("[E{code:04}] Execution error: {message}")]
    Execution {
        code: u16,
        message: String,
        command: Option<String>,
        exit_code: Option<i32>,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("[E{code:04}] Submission error: {message}")]
    Submission {
        code: u16,
        message: String,
        backend: Option<String>,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("[E{code:04}] Cache error: {message}")]
    Cache {
        code: u16,
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("[E{code:04}] Interrupted: {message}")]
    Interrupted {
        code: u16,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("[E{code:04}] {message}")]
    Other {
        code: u16,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },
}

impl SplitflowError {
    /// Create a configuration error with default code
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::configuration_with_code(ErrorCode::CONFIG_GENERIC, message, None)
    }

    /// Create a configuration error with specific code and offending field
    pub fn configuration_with_code(
        code: u16,
        message: impl Into<String>,
        field: Option<String>,
    ) -> Self {
        Self::Configuration {
            code,
            message: message.into(),
            field,
            source: None,
        }
    }

    /// Create an execution error with default code
    pub fn execution(message: impl Into<String>) -> Self {
        Self::execution_with_code(ErrorCode::EXEC_GENERIC, message, None)
    }

    /// Create an execution error with specific code
    pub fn execution_with_code(
        code: u16,
        message: impl Into<String>,
        command: Option<String>,
    ) -> Self {
        Self::Execution {
            code,
            message: message.into(),
            command,
            exit_code: None,
            source: None,
        }
    }

    /// Create a submission error with default code
    pub fn submission(message: impl Into<String>) -> Self {
        Self::submission_with_code(ErrorCode::SUBMIT_GENERIC, message, None)
    }

    /// Create a submission error with specific code and backend name
    pub fn submission_with_code(
        code: u16,
        message: impl Into<String>,
        backend: Option<String>,
    ) -> Self {
        Self::Submission {
            code,
            message: message.into(),
            backend,
            source: None,
        }
    }

    /// Create a cache error with default code
    pub fn cache(message: impl Into<String>) -> Self {
        Self::cache_with_code(ErrorCode::CACHE_GENERIC, message, None)
    }

    /// Create a cache error with specific code and path
    pub fn cache_with_code(code: u16, message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self::Cache {
            code,
            message: message.into(),
            path,
            source: None,
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted {
            code: ErrorCode::OTHER_INTERRUPTED,
            message: message.into(),
            source: None,
        }
    }

    /// Create a generic other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            code: ErrorCode::OTHER_GENERIC,
            message: message.into(),
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(mut self, source: impl Into<BoxedSource>) -> Self {
        match &mut self {
            Self::Configuration { source: src, .. }
            | Self::Execution { source: src, .. }
            | Self::Submission { source: src, .. }
            | Self::Cache { source: src, .. }
            | Self::Interrupted { source: src, .. }
            | Self::Other { source: src, .. } => {
                *src = Some(source.into());
            }
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Configuration { message, .. }
            | Self::Execution { message, .. }
            | Self::Submission { message, .. }
            | Self::Cache { message, .. }
            | Self::Interrupted { message, .. }
            | Self::Other { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
        }
        self
    }

    /// Set the exit code for an execution error
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        if let Self::Execution {
            exit_code: ref mut ec,
            ..
        } = self
        {
            *ec = Some(exit_code);
        }
        self
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } => 2,
            Self::Cache { .. } => 3,
            Self::Execution { .. } => 4,
            Self::Submission { .. } => 5,
            Self::Interrupted { .. } => 130,
            Self::Other { .. } => 1,
        }
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Configuration { code, .. }
            | Self::Execution { code, .. }
            | Self::Submission { code, .. }
            | Self::Cache { code, .. }
            | Self::Interrupted { code, .. }
            | Self::Other { code, .. } => *code,
        }
    }

    /// The bare message without the code prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Configuration { message, .. }
            | Self::Execution { message, .. }
            | Self::Submission { message, .. }
            | Self::Cache { message, .. }
            | Self::Interrupted { message, .. }
            | Self::Other { message, .. } => message,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Type alias for Results using SplitflowError
pub type Result<T> = std::result::Result<T, SplitflowError>;

impl From<std::io::Error> for SplitflowError {
    fn from(err: std::io::Error) -> Self {
        SplitflowError::cache_with_code(ErrorCode::CACHE_IO_ERROR, "I/O operation failed", None)
            .with_source(err)
    }
}

impl From<toml::de::Error> for SplitflowError {
    fn from(err: toml::de::Error) -> Self {
        SplitflowError::configuration_with_code(
            ErrorCode::CONFIG_INVALID_TOML,
            "Invalid TOML syntax",
            None,
        )
        .with_source(err)
    }
}

impl From<serde_json::Error> for SplitflowError {
    fn from(err: serde_json::Error) -> Self {
        SplitflowError::cache_with_code(
            ErrorCode::CACHE_SERIALIZATION_ERROR,
            "JSON serialization failed",
            None,
        )
        .with_source(err)
    }
}
