//! Wire types for the tool-call server.
//!
//! JSON-RPC 2.0 envelopes plus the typed argument structs for each
//! orchestration operation.

use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming JSON-RPC request.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outgoing JSON-RPC response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

impl IntoResponse for JsonRpcResponse {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

fn default_worker_type() -> String {
    "dev".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SpawnWorkerRequest {
    pub task: String,
    #[serde(rename = "type", default = "default_worker_type")]
    pub worker_type: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerStatusRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchContextRequest {
    pub worker_id: String,
    #[serde(default = "default_true")]
    pub preserve_history: bool,
}

#[derive(Debug, Deserialize)]
pub struct ShareKnowledgeRequest {
    pub knowledge: Value,
    #[serde(default)]
    pub target_workers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct MergeWorkRequest {
    pub worker_ids: Vec<String>,
    pub strategy: String,
}

#[derive(Debug, Deserialize)]
pub struct ParallelTaskSpec {
    pub description: String,
    #[serde(default)]
    pub assign_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteParallelRequest {
    pub tasks: Vec<ParallelTaskSpec>,
}

#[derive(Debug, Deserialize)]
pub struct SaveSessionRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreSessionRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct NaturalTaskRequest {
    pub input: String,
    #[serde(default)]
    pub context: Option<Vec<String>>,
    #[serde(default)]
    pub orchflow_context: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct SmartConnectRequest {
    pub target: String,
    #[serde(default = "default_true")]
    pub fuzzy_match: bool,
    #[serde(default)]
    pub orchflow_context: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRichRequest {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub orchflow_context: Option<Value>,
}
