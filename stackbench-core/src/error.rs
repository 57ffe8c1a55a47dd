//! Custom error types for stackbench.
//!
//! Every failure is an explicit enum variant. No `Box<dyn Error>`, no
//! `anyhow::Result` - callers can match on what went wrong.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the benchmark engine.
#[derive(Debug, Error)]
pub enum BenchError {
    // =========================================================================
    // Programmer Errors - Session / Stack / Node Misuse
    // =========================================================================
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    // =========================================================================
    // Configuration Errors - Reported Before Any Resource Is Touched
    // =========================================================================
    #[error("Configuration validation error: {0}")]
    ConfigValidation(#[from] ConfigValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource conflict on {resource}: {diagnostic}")]
    ResourceConflict { resource: String, diagnostic: String },

    // =========================================================================
    // Process Errors - Fatal For The Run, Teardown Still Executes
    // =========================================================================
    #[error("Subprocess failure: {0}")]
    Subprocess(#[from] SubprocessError),

    #[error("Timed out after {waited_ms}ms waiting for {operation}")]
    Timeout { operation: String, waited_ms: u64 },

    #[error("Run of {workload} was cancelled")]
    Cancelled { workload: String },

    // =========================================================================
    // Telemetry Errors
    // =========================================================================
    #[error("Telemetry schema drift: {0}")]
    TelemetrySchemaDrift(#[from] SchemaDrift),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {context}: {message}")]
    Parse { context: String, message: String },
}

impl BenchError {
    /// Build a mapper for `map_err` that tags an IO error with context.
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> BenchError {
        let context = context.into();
        move |source| BenchError::Io { context, source }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_schema_drift(&self) -> bool {
        matches!(self, Self::TelemetrySchemaDrift(_))
    }
}

/// Misuse of a single-use protocol. Always fatal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("{subject}: start() called more than once")]
    AlreadyStarted { subject: String },

    #[error("{subject}: {operation}() called before start()")]
    NotStarted {
        subject: String,
        operation: &'static str,
    },

    #[error("{subject}: end() called more than once")]
    AlreadyEnded { subject: String },

    #[error("{subject}: result() called before end()")]
    NotEnded { subject: String },

    #[error("{subject}: entered twice")]
    AlreadyEntered { subject: String },

    #[error("{subject}: exited while not entered")]
    NotEntered { subject: String },

    #[error("resource stack was already released and cannot be reused")]
    StackReleased,

    #[error("Cannot transition run from {from} to {to}")]
    InvalidPhaseTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("counter {key} reported twice within one update frame")]
    DuplicateCounter { key: String },
}

/// Configuration errors. Raised while validating input, before setup begins.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Duplicate collector name: {name}")]
    DuplicateCollector { name: String },

    #[error("Inventory lookup for '{label}' failed: {reason}")]
    InventoryLookup { label: String, reason: String },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Failures of external processes (setup commands, workloads, collectors).
#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Command `{command}` exited with {code:?}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Workload {workload} exited with {code:?}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    WorkloadFailed {
        workload: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Workload {workload} exited during {phase} (code {code:?}), no steady state observed")]
    ExitedBeforeSteadyState {
        workload: String,
        phase: &'static str,
        code: Option<i32>,
    },

    #[error("Telemetry collector {collector} closed its output before producing an update")]
    CollectorExited { collector: String },
}

/// Two counter snapshots that should share a key set do not.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing keys {missing:?}, unexpected keys {unexpected:?}")]
pub struct SchemaDrift {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Result type alias using BenchError.
pub type BenchResult<T> = Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation_error_display() {
        let err = ConfigValidationError::MissingRequiredField {
            field: "runtime_seconds",
            context: "workload 'fio'".to_string(),
        };
        assert!(err.to_string().contains("runtime_seconds"));
        assert!(err.to_string().contains("fio"));
    }

    #[test]
    fn test_error_chain() {
        let violation = ProtocolViolation::AlreadyStarted {
            subject: "cpu".to_string(),
        };
        let err: BenchError = violation.into();
        assert!(err.is_protocol_violation());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_schema_drift_lists_keys() {
        let drift = SchemaDrift {
            missing: vec!["b".to_string()],
            unexpected: vec!["c".to_string()],
        };
        let text = BenchError::from(drift).to_string();
        assert!(text.contains("\"b\""));
        assert!(text.contains("\"c\""));
    }
}
