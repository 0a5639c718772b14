use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::Checksum;
use crate::task::Value;

/// Outcome of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub checksum: Checksum,
    /// `None` when the process never produced an exit status
    pub return_code: Option<i32>,
    /// Output bindings: `return_code`, `stdout`, `stderr`
    pub outputs: IndexMap<String, Value>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub errored: bool,
    pub error: Option<String>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Build a result from a finished process
    pub fn completed(
        checksum: Checksum,
        return_code: i32,
        stdout: &str,
        stderr: &str,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
        duration: Duration,
    ) -> Self {
        let mut outputs = IndexMap::new();
        outputs.insert("return_code".to_string(), Value::from(i64::from(return_code)));
        outputs.insert("stdout".to_string(), Value::from(strip_newline(stdout)));
        outputs.insert("stderr".to_string(), Value::from(strip_newline(stderr)));

        let (errored, error) = if return_code == 0 {
            (false, None)
        } else {
            (
                true,
                Some(format!(
                    "return code {}; stderr at {}",
                    return_code,
                    stderr_path.display()
                )),
            )
        };

        Self {
            checksum,
            return_code: Some(return_code),
            outputs,
            stdout_path: Some(stdout_path),
            stderr_path: Some(stderr_path),
            errored,
            error,
            duration,
        }
    }

    /// A result for an instance that never produced a return code
    pub fn errored(checksum: Checksum, description: impl Into<String>) -> Self {
        Self {
            checksum,
            return_code: None,
            outputs: IndexMap::new(),
            stdout_path: None,
            stderr_path: None,
            errored: true,
            error: Some(description.into()),
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.errored && self.return_code == Some(0)
    }

    /// Captured stdout, without the trailing newline
    pub fn stdout(&self) -> Option<&str> {
        self.outputs.get("stdout").and_then(Value::as_str)
    }

    pub fn stderr(&self) -> Option<&str> {
        self.outputs.get("stderr").and_then(Value::as_str)
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }
}

fn strip_newline(text: &str) -> String {
    text.strip_suffix('\n')
        .map(|t| t.strip_suffix('\r').unwrap_or(t))
        .unwrap_or(text)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_zero_exit_is_errored_with_reference() {
        let result = ExecutionResult::completed(
            Checksum::of_bytes(b"x"),
            2,
            "",
            "boom\n",
            PathBuf::from("/w/stdout.txt"),
            PathBuf::from("/w/stderr.txt"),
            Duration::from_millis(3),
        );
        assert!(result.errored);
        assert!(!result.is_success());
        let error = result.error.as_deref().unwrap();
        assert!(error.contains("return code 2"));
        assert!(error.contains("/w/stderr.txt"));
        assert_eq!(result.stderr(), Some("boom"));
        assert_eq!(result.output("return_code"), Some(&Value::from(2i64)));
    }

    #[test]
    fn test_serialized_form_round_trips() {
        let result = ExecutionResult::completed(
            Checksum::of_bytes(b"y"),
            0,
            "one\n",
            "",
            PathBuf::from("/w/stdout.txt"),
            PathBuf::from("/w/stderr.txt"),
            Duration::from_millis(1500),
        );
        let json = serde_json::to_string(&result).unwrap();
        let back: ExecutionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.stdout(), Some("one"));
    }
}
