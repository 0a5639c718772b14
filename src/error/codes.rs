/// Error code registry for splitflow
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Cache errors
/// - 3000-3999: Execution errors
/// - 4000-4999: Submission errors
/// - 9000-9999: Other errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_INVALID_TOML: u16 = 1002;
    pub const CONFIG_INVALID_VALUE: u16 = 1003;
    pub const CONFIG_UNKNOWN_BACKEND: u16 = 1004;
    pub const CONFIG_INVALID_SPLITTER: u16 = 1005;
    pub const CONFIG_INVALID_COMBINER: u16 = 1006;
    pub const CONFIG_SPLIT_LENGTH_MISMATCH: u16 = 1007;
    pub const CONFIG_MISSING_FIELD: u16 = 1008;
    pub const CONFIG_INVALID_COMMAND: u16 = 1009;

    // Cache errors (2000-2999)
    pub const CACHE_GENERIC: u16 = 2000;
    pub const CACHE_IO_ERROR: u16 = 2001;
    pub const CACHE_LEASE_FAILED: u16 = 2002;
    pub const CACHE_LEASE_BUSY: u16 = 2003;
    pub const CACHE_CORRUPTED: u16 = 2004;
    pub const CACHE_SERIALIZATION_ERROR: u16 = 2005;
    pub const CACHE_TIMEOUT: u16 = 2006;

    // Execution errors (3000-3999)
    pub const EXEC_GENERIC: u16 = 3000;
    pub const EXEC_COMMAND_NOT_FOUND: u16 = 3001;
    pub const EXEC_TIMEOUT: u16 = 3002;
    pub const EXEC_SUBPROCESS_FAILED: u16 = 3003;
    pub const EXEC_SPAWN_FAILED: u16 = 3004;
    pub const EXEC_SIGNAL_RECEIVED: u16 = 3005;
    pub const EXEC_OUTPUT_ERROR: u16 = 3006;

    // Submission errors (4000-4999)
    pub const SUBMIT_GENERIC: u16 = 4000;
    pub const SUBMIT_REJECTED: u16 = 4001;
    pub const SUBMIT_RETRIES_EXHAUSTED: u16 = 4002;
    pub const SUBMIT_BACKEND_CLOSED: u16 = 4003;
    pub const SUBMIT_STATUS_UNAVAILABLE: u16 = 4004;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_INTERRUPTED: u16 = 9001;
    pub const OTHER_INTERNAL: u16 = 9002;
}

/// Get a human-readable description of an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        ErrorCode::CONFIG_GENERIC => "General configuration error",
        ErrorCode::CONFIG_NOT_FOUND => "Configuration file not found",
        ErrorCode::CONFIG_INVALID_TOML => "Invalid TOML syntax",
        ErrorCode::CONFIG_INVALID_VALUE => "Invalid configuration value",
        ErrorCode::CONFIG_UNKNOWN_BACKEND => "Unknown backend",
        ErrorCode::CONFIG_INVALID_SPLITTER => "Malformed split declaration",
        ErrorCode::CONFIG_INVALID_COMBINER => "Malformed combine declaration",
        ErrorCode::CONFIG_SPLIT_LENGTH_MISMATCH => "Scalar split fields have different lengths",
        ErrorCode::CONFIG_MISSING_FIELD => "Split field missing from inputs",
        ErrorCode::CONFIG_INVALID_COMMAND => "Command line could not be resolved",

        ErrorCode::CACHE_GENERIC => "General cache error",
        ErrorCode::CACHE_IO_ERROR => "Cache I/O failure",
        ErrorCode::CACHE_LEASE_FAILED => "Could not acquire or release a cache lease",
        ErrorCode::CACHE_LEASE_BUSY => "Cache lease held by another executor",
        ErrorCode::CACHE_CORRUPTED => "Committed cache entry is unreadable",
        ErrorCode::CACHE_SERIALIZATION_ERROR => "Cache serialization failure",
        ErrorCode::CACHE_TIMEOUT => "Timed out waiting for a cache entry",

        ErrorCode::EXEC_GENERIC => "General execution error",
        ErrorCode::EXEC_COMMAND_NOT_FOUND => "Command not found",
        ErrorCode::EXEC_TIMEOUT => "Process timed out",
        ErrorCode::EXEC_SUBPROCESS_FAILED => "Process exited with non-zero status",
        ErrorCode::EXEC_SPAWN_FAILED => "Process could not be started",
        ErrorCode::EXEC_SIGNAL_RECEIVED => "Process terminated by signal",
        ErrorCode::EXEC_OUTPUT_ERROR => "Process output could not be captured",

        ErrorCode::SUBMIT_GENERIC => "General submission error",
        ErrorCode::SUBMIT_REJECTED => "Scheduler rejected the submission",
        ErrorCode::SUBMIT_RETRIES_EXHAUSTED => "Submission retries exhausted",
        ErrorCode::SUBMIT_BACKEND_CLOSED => "Backend is closed",
        ErrorCode::SUBMIT_STATUS_UNAVAILABLE => "Job status unavailable",

        ErrorCode::OTHER_INTERRUPTED => "Interrupted",
        ErrorCode::OTHER_INTERNAL => "Internal error",
        _ => "Unknown error",
    }
}
