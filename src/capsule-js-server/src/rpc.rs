//! JSON-RPC 2.0 framing shared by both transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ops::{ExecuteParams, ListParams, OpError, OpReply, RunTaskParams, SearchParams, Service};

/// One incoming request frame.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    /// Protocol marker; anything but "2.0" is rejected.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Request id echoed in the response; null for notifications.
    #[serde(default)]
    pub id: Value,
    /// Operation name.
    pub method: String,
    /// Operation parameters.
    #[serde(default)]
    pub params: Value,
}

fn default_version() -> String {
    "2.0".to_string()
}

/// One outgoing response frame.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorBody>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
pub struct RpcErrorBody {
    /// Standard JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl RpcResponse {
    fn result(id: Value, reply: OpReply) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(serde_json::json!({
                "summary": reply.summary,
                "payload": reply.payload,
            })),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcErrorBody { code, message }),
        }
    }

    /// A `-32700` frame for input that was not valid JSON.
    pub fn parse_error(message: String) -> Self {
        Self::error(Value::Null, -32700, message)
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, OpError> {
    serde_json::from_value(params).map_err(|e| OpError {
        code: -32602,
        message: format!("invalid params: {e}"),
    })
}

/// Dispatch one frame to the operation surface.
pub async fn dispatch(service: &Service, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    if request.jsonrpc != "2.0" {
        return RpcResponse::error(id, -32600, "unsupported jsonrpc version".to_string());
    }

    let outcome = match request.method.as_str() {
        "execute" => match decode::<ExecuteParams>(request.params) {
            Ok(params) => service.execute(params).await,
            Err(error) => Err(error),
        },
        "list" => match decode::<ListParams>(request.params) {
            Ok(params) => service.list(params).await,
            Err(error) => Err(error),
        },
        "search" => match decode::<SearchParams>(request.params) {
            Ok(params) => service.search(params).await,
            Err(error) => Err(error),
        },
        "run-named-task" => match decode::<RunTaskParams>(request.params) {
            Ok(params) => service.run_task(params).await,
            Err(error) => Err(error),
        },
        other => Err(OpError {
            code: -32601,
            message: format!("method not found: {other:?}"),
        }),
    };

    match outcome {
        Ok(reply) => RpcResponse::result(id, reply),
        Err(error) => RpcResponse::error(id, error.code, error.message),
    }
}
