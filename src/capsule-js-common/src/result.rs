//! Execution results and wire-visible failure kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The failure kinds a run can resolve with. The `name()` strings are
/// wire-stable and appear as the `name` field of [`ErrorDetail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The normalizer could not parse the snippet. No worker was spawned.
    Syntax,
    /// Static analysis rejected the snippet. No worker was spawned.
    Analysis,
    /// Wall clock exceeded the configured timeout; the worker was terminated.
    Timeout,
    /// The worker failed outside user code (engine init, channel loss).
    Worker,
    /// User code threw and the error escaped to the top level.
    Runtime,
    /// An adapter call named an unknown adapter or method.
    AdapterMethodNotFound,
    /// Sandboxed code hit a neutralized network primitive.
    NetworkBlocked,
}

impl FailureKind {
    /// The wire-stable error name.
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::Syntax => "SyntaxError",
            FailureKind::Analysis => "AnalysisError",
            FailureKind::Timeout => "TimeoutError",
            FailureKind::Worker => "WorkerError",
            FailureKind::Runtime => "RuntimeError",
            FailureKind::AdapterMethodNotFound => "AdapterMethodNotFound",
            FailureKind::NetworkBlocked => "NetworkBlocked",
        }
    }
}

/// Structured error reported to callers: name, message and a truncated stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error name. For user throws this is the thrown error's own name
    /// (`TypeError`, `RangeError`, ...); for host failures it is one of the
    /// [`FailureKind`] names.
    pub name: String,
    /// Error message.
    pub message: String,
    /// Up to [`crate::MAX_STACK_FRAMES`] stack frames, innermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

impl ErrorDetail {
    /// Build a detail with the given name and message and no stack.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Build a detail for a host-side failure kind.
    pub fn for_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::new(kind.name(), message)
    }
}

/// What the worker reports back in its terminal `result` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Whether the snippet ran to completion without throwing.
    pub success: bool,
    /// Returned value on success. `None` means the snippet returned
    /// `undefined`.
    #[serde(default)]
    pub value: Option<Value>,
    /// Error detail on failure.
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    /// Console output collected during the run, severity-prefixed.
    #[serde(default)]
    pub logs: Vec<String>,
}

/// The resolved result of one end-to-end run, as returned by the
/// orchestrator and carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the run succeeded.
    pub success: bool,
    /// Returned (and summarized) value on success.
    #[serde(default)]
    pub value: Option<Value>,
    /// Error detail on failure.
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    /// Analyzer warnings plus in-sandbox console output.
    pub logs: Vec<String>,
    /// Wall-clock duration of the run.
    pub execution_time_ms: u64,
    /// Whether summarization cut anything from the value.
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    /// A successful result.
    pub fn ok(value: Option<Value>, logs: Vec<String>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            value,
            error: None,
            logs,
            execution_time_ms,
            truncated: false,
        }
    }

    /// A failed result.
    pub fn err(error: ErrorDetail, logs: Vec<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error),
            logs,
            execution_time_ms,
            truncated: false,
        }
    }

    /// Mark the result as truncated by summarization.
    pub fn truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    /// The failure name, if this result failed.
    pub fn error_name(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_names_are_stable() {
        assert_eq!(FailureKind::Syntax.name(), "SyntaxError");
        assert_eq!(FailureKind::Analysis.name(), "AnalysisError");
        assert_eq!(FailureKind::Timeout.name(), "TimeoutError");
        assert_eq!(FailureKind::Worker.name(), "WorkerError");
        assert_eq!(FailureKind::Runtime.name(), "RuntimeError");
    }

    #[test]
    fn undefined_value_serializes_as_absent() {
        let result = ExecutionResult::ok(None, vec![], 3);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["value"], Value::Null);
    }
}
