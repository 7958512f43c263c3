use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Main error type for the task orchestration core
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum TaskflowError {
    /// Empty or missing required parameter (task-exec ID, config, key)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Config or metadata absent or expired, or a task not in the expected state
    #[error("not found: {0}")]
    NotFound(String),

    /// Structural validation failure of a task config
    #[error("{0}")]
    ValidationFailed(String),

    /// Parent-status recursion revisited a state ID
    #[error("cycle detected: state {0} already visited in parent status update")]
    Cycle(String),

    /// Parent-status recursion exceeded the depth ceiling
    #[error("maximum recursion depth {max} exceeded (depth {depth})")]
    DepthExceeded { depth: usize, max: usize },

    /// Output-mapping evaluation error
    #[error("output transformation failed: {0}")]
    TransformationFailed(String),

    /// Task failed and no error transition is configured
    #[error("task failed with no error transition defined{}", .0.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    NoRecoveryPath(Option<String>),

    /// Cancellation observed while an operation was running
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Backend storage failure
    #[error("storage error during {operation} for key '{key}': {message}")]
    Storage {
        operation: String,
        key: String,
        message: String,
    },

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Template or expression evaluation errors
    #[error("template error: {0}")]
    Template(String),

    /// An error wrapped with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TaskflowError>,
    },
}

impl TaskflowError {
    /// Creates a storage error carrying the operation and key
    pub fn storage(
        operation: impl Into<String>,
        key: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        TaskflowError::Storage {
            operation: operation.into(),
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Wraps this error with a description of the failing operation
    pub fn context(self, context: impl Into<String>) -> Self {
        TaskflowError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error of a wrapping chain
    pub fn root(&self) -> &TaskflowError {
        let mut current = self;
        while let TaskflowError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// True when the root cause is a missing config, metadata blob or state
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), TaskflowError::NotFound(_))
    }

    /// True when the root cause is cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), TaskflowError::Cancelled(_))
    }

    /// Short machine-readable code for the root cause
    pub fn code(&self) -> &'static str {
        match self.root() {
            TaskflowError::InvalidArgument(_) => "invalid_argument",
            TaskflowError::NotFound(_) => "not_found",
            TaskflowError::ValidationFailed(_) => "validation_failed",
            TaskflowError::Cycle(_) => "cycle_detected",
            TaskflowError::DepthExceeded { .. } => "depth_exceeded",
            TaskflowError::TransformationFailed(_) => "transformation_failed",
            TaskflowError::NoRecoveryPath(_) => "no_recovery_path",
            TaskflowError::Cancelled(_) => "cancelled",
            TaskflowError::Storage { .. } => "storage_error",
            TaskflowError::Serialization(_) => "serialization_error",
            TaskflowError::Template(_) => "template_error",
            TaskflowError::Context { .. } => "unknown_error",
        }
    }
}

impl From<serde_json::Error> for TaskflowError {
    fn from(err: serde_json::Error) -> Self {
        TaskflowError::Serialization(err.to_string())
    }
}

/// Attaches operation context to fallible results
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// Type alias for Result with TaskflowError
pub type Result<T> = std::result::Result<T, TaskflowError>;

/// Structured error information persisted on a task state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (e.g. "execution_error", "child_task_failure")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Free-form diagnostic details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,

    /// Timestamp when the error occurred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ErrorInfo {
    /// Create an error info from a crate error, keeping its display text
    pub fn from_error(code: impl Into<String>, error: &TaskflowError) -> Self {
        ErrorInfoBuilder::new(code, error.to_string()).build()
    }

    /// Create a builder for ErrorInfo
    pub fn builder(code: impl Into<String>, message: impl Into<String>) -> ErrorInfoBuilder {
        ErrorInfoBuilder::new(code, message)
    }
}

/// Builder for creating ErrorInfo instances with a fluent API
pub struct ErrorInfoBuilder {
    code: String,
    message: String,
    details: Option<Map<String, Value>>,
    timestamp: Option<String>,
}

impl ErrorInfoBuilder {
    /// Create a new ErrorInfoBuilder with required fields
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Add a single detail entry
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set custom timestamp (defaults to now if not set)
    pub fn timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Build the ErrorInfo instance
    pub fn build(self) -> ErrorInfo {
        ErrorInfo {
            code: self.code,
            message: self.message,
            details: self.details,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain_display_and_root() {
        let err = TaskflowError::NotFound("config not found for id abc".to_string())
            .context("failed to load task config");

        assert_eq!(
            err.to_string(),
            "failed to load task config: not found: config not found for id abc"
        );
        assert!(err.is_not_found());
        assert!(!err.is_cancelled());
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_no_recovery_path_message() {
        let bare = TaskflowError::NoRecoveryPath(None);
        assert_eq!(bare.to_string(), "task failed with no error transition defined");

        let wrapped = TaskflowError::NoRecoveryPath(Some("boom".to_string()));
        assert_eq!(
            wrapped.to_string(),
            "task failed with no error transition defined: boom"
        );
    }

    #[test]
    fn test_storage_error_names_operation_and_key() {
        let err = TaskflowError::storage("get", "config:123", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("get"));
        assert!(msg.contains("config:123"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_error_info_builder() {
        let error = ErrorInfo::builder("child_task_failure", "parent failed").build();
        assert_eq!(error.code, "child_task_failure");
        assert!(error.timestamp.is_some());
        assert!(error.details.is_none());

        let error = ErrorInfo::builder("child_task_failure", "parent failed")
            .detail("failed_count", 2)
            .detail("child_task_id", "child-1")
            .timestamp("2024-01-01T00:00:00Z")
            .build();

        let details = error.details.unwrap();
        assert_eq!(details["failed_count"], 2);
        assert_eq!(details["child_task_id"], "child-1");
        assert_eq!(error.timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
    }
}
