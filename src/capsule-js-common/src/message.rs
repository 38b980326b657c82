//! The message protocol between the host and an interpreter worker.
//!
//! A worker lifetime is one exchange of `init` / `ready` / `execute` /
//! `result`, with any number of `adapter-call` / `adapter-result` pairs in
//! between. Messages are tagged records; the tag names are part of the
//! protocol and must not change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::RunOutcome;

/// The adapter methods visible to sandboxed code: adapter name → method names.
///
/// Only names travel to the worker; descriptors (schemas, handlers) stay on
/// the host side of the bridge.
pub type AdapterCatalog = BTreeMap<String, Vec<String>>;

/// Payload of the `init` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInit {
    /// Network policy preamble, evaluated before anything user-visible.
    pub preamble: String,
    /// Adapter method catalog used to synthesize the `adapters.*` proxies.
    pub adapters: AdapterCatalog,
    /// Host-injected global variables, installed verbatim on the global object.
    pub globals: BTreeMap<String, Value>,
    /// Read-only environment record exposed as the frozen `env` global.
    pub env: BTreeMap<String, String>,
    /// Whether the snippet is compiled as the body of an async callable.
    pub allow_async: bool,
    /// Interpreter heap ceiling, if configured.
    pub memory_limit_bytes: Option<usize>,
    /// Cap on collected console lines for the run.
    pub max_log_lines: usize,
}

/// Messages sent from the host to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HostMessage {
    /// Configure the freshly created execution context.
    Init(WorkerInit),
    /// Run the (already normalized) snippet.
    Execute {
        /// Source text compiled as the body of a fresh callable.
        code: String,
    },
    /// Reply to an earlier `adapter-call`, matched by id.
    AdapterResult {
        /// Id assigned by the worker when the call was emitted.
        id: u64,
        /// Present on success.
        #[serde(default)]
        result: Option<Value>,
        /// Present on failure; the worker rejects the pending call with it.
        #[serde(default)]
        error: Option<String>,
    },
}

/// Messages sent from the worker to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// The context is initialized and the worker is waiting for `execute`.
    Ready,
    /// Sandboxed code invoked an adapter method.
    AdapterCall {
        /// Fresh id, unique within this worker's lifetime.
        id: u64,
        /// Adapter name as listed in the catalog.
        adapter: String,
        /// Method name on that adapter.
        method: String,
        /// Arguments marshalled by value.
        args: Vec<Value>,
    },
    /// Terminal message: the snippet ran to completion (successfully or not).
    Result(RunOutcome),
    /// Terminal message: the worker itself failed outside user code.
    Fatal {
        /// Human-readable description of the engine-level failure.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tags_are_wire_stable() {
        let msg = WorkerMessage::AdapterCall {
            id: 7,
            adapter: "api".into(),
            method: "getData".into(),
            args: vec![Value::from(1)],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "adapter-call");
        assert_eq!(json["id"], 7);

        let reply = HostMessage::AdapterResult {
            id: 7,
            result: Some(Value::from("ok")),
            error: None,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["kind"], "adapter-result");
    }

    #[test]
    fn adapter_result_error_roundtrips() {
        let raw = r#"{"kind":"adapter-result","id":3,"error":"method not found"}"#;
        let msg: HostMessage = serde_json::from_str(raw).unwrap();
        match msg {
            HostMessage::AdapterResult { id, result, error } => {
                assert_eq!(id, 3);
                assert!(result.is_none());
                assert_eq!(error.as_deref(), Some("method not found"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
