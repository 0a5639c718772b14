use super::{ErrorCode, SplitflowError};
use std::path::Path;

/// Create a not found error for a configuration or task file
pub fn config_not_found(path: impl AsRef<Path>) -> SplitflowError {
    SplitflowError::configuration_with_code(
        ErrorCode::CONFIG_NOT_FOUND,
        format!("File not found: {}", path.as_ref().display()),
        None,
    )
}
