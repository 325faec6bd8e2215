//! Tool-call operation handlers.
//!
//! Each operation is a thin adapter: validate arguments, touch the
//! relevant services, and return a structured reply carrying `success`
//! plus suggested next steps where the state supports them.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::{jaccard_similarity, Task};
use crate::services::runtime::OrchflowRuntime;
use crate::services::task_graph::TaskFilter;

use super::types::{
    ExecuteParallelRequest, JsonRpcRequest, JsonRpcResponse, MergeWorkRequest,
    NaturalTaskRequest, RestoreSessionRequest, SaveSessionRequest, ShareKnowledgeRequest,
    SmartConnectRequest, SpawnWorkerRequest, StatusRichRequest, SwitchContextRequest,
    WorkerStatusRequest,
};

/// Application state for the tool-call server.
#[derive(Clone)]
pub struct ServerState {
    pub runtime: Arc<OrchflowRuntime>,
}

pub async fn handle_request(
    State(state): State<ServerState>,
    Json(request): Json<JsonRpcRequest>,
) -> JsonRpcResponse {
    debug!(method = %request.method, "tool-call request");
    let id = request.id.clone();

    match request.method.as_str() {
        "initialize" => handle_initialize(id),
        "tools/list" => handle_list_tools(id),
        "tools/call" => handle_tool_call(state, request).await,
        other => JsonRpcResponse::error(id, -32601, format!("Method not found: {other}")),
    }
}

fn handle_initialize(id: Option<Value>) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "orchflow-orchestrator",
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

fn handle_list_tools(id: Option<Value>) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({
            "tools": [
                {
                    "name": "spawn_worker",
                    "description": "Spawn a worker for a described task",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "task": { "type": "string" },
                            "type": { "type": "string", "default": "dev" },
                            "metadata": { "type": "object" }
                        },
                        "required": ["task"]
                    }
                },
                {
                    "name": "worker_status",
                    "description": "Status of one worker or the whole pool",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "worker_id": { "type": "string" } }
                    }
                },
                {
                    "name": "switch_context",
                    "description": "Switch the conversation to a worker, restoring its context",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "worker_id": { "type": "string" },
                            "preserve_history": { "type": "boolean", "default": true }
                        },
                        "required": ["worker_id"]
                    }
                },
                {
                    "name": "share_knowledge",
                    "description": "Share a knowledge object with some or all workers",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "knowledge": { "type": "object" },
                            "target_workers": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["knowledge"]
                    }
                },
                {
                    "name": "merge_work",
                    "description": "Merge the work of several workers",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "worker_ids": { "type": "array", "items": { "type": "string" } },
                            "strategy": { "type": "string", "enum": ["combine", "sequential", "overlay"] }
                        },
                        "required": ["worker_ids", "strategy"]
                    }
                },
                {
                    "name": "execute_parallel",
                    "description": "Submit several tasks for parallel execution",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "tasks": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "description": { "type": "string" },
                                        "assign_to": { "type": "string" }
                                    },
                                    "required": ["description"]
                                }
                            }
                        },
                        "required": ["tasks"]
                    }
                },
                {
                    "name": "save_session",
                    "description": "Persist the current worker set and task state under a name",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "description": { "type": "string" }
                        },
                        "required": ["name"]
                    }
                },
                {
                    "name": "restore_session",
                    "description": "Restore a previously saved session",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "name": { "type": "string" } },
                        "required": ["name"]
                    }
                },
                {
                    "name": "natural_task",
                    "description": "Route a natural-language task to a suitable worker",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "input": { "type": "string" },
                            "context": { "type": "array", "items": { "type": "string" } },
                            "orchflow_context": { "type": "object" }
                        },
                        "required": ["input"]
                    }
                },
                {
                    "name": "smart_connect",
                    "description": "Connect to a worker by key, id, or fuzzy name",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "target": { "type": "string" },
                            "fuzzy_match": { "type": "boolean", "default": true },
                            "orchflow_context": { "type": "object" }
                        },
                        "required": ["target"]
                    }
                },
                {
                    "name": "status_rich",
                    "description": "Structured dashboard of tasks, workers, locks, and metrics",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "format": { "type": "string" },
                            "orchflow_context": { "type": "object" }
                        }
                    }
                }
            ]
        }),
    )
}

async fn handle_tool_call(state: ServerState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    let Some(params) = request.params else {
        return JsonRpcResponse::error(id, -32600, "Missing params");
    };
    let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::error(id, -32600, "Missing tool name");
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let runtime = &state.runtime;
    let outcome = match tool_name {
        "spawn_worker" => spawn_worker(runtime, arguments).await,
        "worker_status" => worker_status(runtime, arguments).await,
        "switch_context" => switch_context(runtime, arguments).await,
        "share_knowledge" => share_knowledge(runtime, arguments).await,
        "merge_work" => merge_work(runtime, arguments).await,
        "execute_parallel" => execute_parallel(runtime, arguments).await,
        "save_session" => save_session(runtime, arguments).await,
        "restore_session" => restore_session(runtime, arguments).await,
        "natural_task" => natural_task(runtime, arguments).await,
        "smart_connect" => smart_connect(runtime, arguments).await,
        "status_rich" => status_rich(runtime, arguments).await,
        other => Err(OrchestratorError::UnknownOperation(other.to_string())),
    };

    let reply = match outcome {
        Ok(value) => value,
        Err(err) => {
            error!(tool = tool_name, %err, "operation failed");
            error_reply(runtime, &err).await
        }
    };

    JsonRpcResponse::success(
        id,
        json!({
            "content": [
                { "type": "text", "text": reply.to_string() }
            ]
        }),
    )
}

/// Failure reply shape: kind, message, and nearest-match suggestions for
/// unknown workers.
async fn error_reply(runtime: &Arc<OrchflowRuntime>, err: &OrchestratorError) -> Value {
    let mut reply = json!({
        "success": false,
        "error": {
            "kind": err.kind().as_str(),
            "message": err.to_string(),
        }
    });

    if let OrchestratorError::WorkerNotFound(reference) = err {
        let suggestions = name_suggestions(runtime, reference).await;
        if !suggestions.is_empty() {
            reply["suggestions"] = json!(suggestions);
        }
    }
    reply
}

async fn name_suggestions(runtime: &Arc<OrchflowRuntime>, target: &str) -> Vec<String> {
    let mut scored: Vec<(f64, String)> = Vec::new();
    for name in runtime.worker_manager.worker_names().await {
        let score = jaccard_similarity(&name.replace('-', " "), &target.to_lowercase());
        scored.push((score, name));
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(3).map(|(_, name)| name).collect()
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> OrchResult<T> {
    serde_json::from_value(arguments)
        .map_err(|e| OrchestratorError::invalid_argument("arguments", e.to_string()))
}

// ----------------------------------------------------------------------
// Operations
// ----------------------------------------------------------------------

async fn spawn_worker(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: SpawnWorkerRequest = parse_args(arguments)?;
    if params.task.trim().is_empty() {
        return Err(OrchestratorError::invalid_argument("task", "cannot be empty"));
    }

    let (snapshot, key) = runtime
        .spawn_worker(&params.worker_type, &params.task)
        .await?;
    if let Some(metadata) = params.metadata {
        let key = format!(
            "{}/workers/{}/metadata",
            runtime.memory.namespace(),
            snapshot.worker_id
        );
        let _ = runtime.memory.store(&key, &metadata, None).await;
    }

    info!(worker_id = %snapshot.worker_id, name = %snapshot.name, "worker spawned via tool call");
    Ok(json!({
        "success": true,
        "worker_id": snapshot.worker_id,
        "name": snapshot.name,
        "type": snapshot.worker_type,
        "quick_access_key": key,
        "status": snapshot.status.as_str(),
    }))
}

async fn worker_status(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: WorkerStatusRequest = parse_args(arguments)?;

    match params.worker_id {
        Some(reference) => {
            let worker_id = runtime.resolve_worker(&reference).await?;
            let status = one_worker_status(runtime, worker_id).await?;
            Ok(json!({ "success": true, "worker": status }))
        }
        None => {
            let mut workers = Vec::new();
            for snapshot in runtime.worker_manager.list_workers().await {
                if let Ok(status) = one_worker_status(runtime, snapshot.worker_id).await {
                    workers.push(status);
                }
            }
            Ok(json!({ "success": true, "workers": workers }))
        }
    }
}

async fn one_worker_status(
    runtime: &Arc<OrchflowRuntime>,
    worker_id: Uuid,
) -> OrchResult<Value> {
    let snapshot = runtime
        .worker_manager
        .snapshot(worker_id)
        .await
        .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?;
    let context = runtime.memory.load_worker_context(worker_id).await?;

    Ok(json!({
        "worker_id": snapshot.worker_id,
        "name": snapshot.name,
        "type": snapshot.worker_type,
        "status": snapshot.status.as_str(),
        "progress": context.as_ref().map_or(0, |c| c.progress),
        "current_task": context.as_ref().map(|c| c.task_description.clone()),
        "quick_access_key": runtime.quick_key_for(worker_id).await,
    }))
}

async fn switch_context(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: SwitchContextRequest = parse_args(arguments)?;
    let worker_id = runtime.resolve_worker(&params.worker_id).await?;
    let snapshot = runtime
        .worker_manager
        .snapshot(worker_id)
        .await
        .ok_or_else(|| OrchestratorError::WorkerNotFound(params.worker_id.clone()))?;

    let history = if params.preserve_history {
        runtime.worker_manager.recent_output(worker_id, 50).await
    } else {
        Vec::new()
    };
    let decisions = runtime.memory.worker_decisions(worker_id, 20).await?;
    let knowledge_pattern = format!("{}/knowledge/*", runtime.memory.namespace());
    let shared: Vec<Value> = runtime
        .memory
        .search(&knowledge_pattern, 10)
        .await?
        .into_iter()
        .map(|e| e.value)
        .collect();

    Ok(json!({
        "success": true,
        "worker_id": worker_id,
        "worker_name": snapshot.name,
        "conversation_history": history,
        "decisions": decisions,
        "shared_knowledge": shared,
    }))
}

async fn share_knowledge(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: ShareKnowledgeRequest = parse_args(arguments)?;

    let targets: Vec<Uuid> = match params.target_workers {
        Some(references) => {
            let mut ids = Vec::new();
            for reference in references {
                ids.push(runtime.resolve_worker(&reference).await?);
            }
            ids
        }
        None => runtime
            .worker_manager
            .list_workers()
            .await
            .into_iter()
            .map(|s| s.worker_id)
            .collect(),
    };

    let key = format!(
        "{}/knowledge/{}",
        runtime.memory.namespace(),
        Utc::now().timestamp_millis()
    );
    let record = json!({
        "knowledge": params.knowledge,
        "shared_with": targets,
        "shared_at": Utc::now(),
    });
    runtime.memory.store(&key, &record, None).await?;

    let mut shared_with = Vec::new();
    for worker_id in targets {
        if let Some(snapshot) = runtime.worker_manager.snapshot(worker_id).await {
            let _ = runtime
                .memory
                .record_decision(worker_id, &format!("received shared knowledge under {key}"))
                .await;
            shared_with.push(snapshot.name);
        }
    }
    Ok(json!({ "success": true, "shared_with": shared_with }))
}

async fn merge_work(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: MergeWorkRequest = parse_args(arguments)?;
    if params.worker_ids.is_empty() {
        return Err(OrchestratorError::invalid_argument(
            "worker_ids",
            "at least one worker required",
        ));
    }

    let mut contributions = Vec::new();
    for reference in &params.worker_ids {
        let worker_id = runtime.resolve_worker(reference).await?;
        let snapshot = runtime
            .worker_manager
            .snapshot(worker_id)
            .await
            .ok_or_else(|| OrchestratorError::WorkerNotFound(reference.clone()))?;
        let context = runtime.memory.load_worker_context(worker_id).await?;
        contributions.push((snapshot.name, context));
    }

    let merged = match params.strategy.as_str() {
        "combine" => {
            // Side-by-side artifact keyed by worker name
            let mut combined = serde_json::Map::new();
            for (name, context) in contributions {
                combined.insert(name, serde_json::to_value(context)?);
            }
            Value::Object(combined)
        }
        "sequential" => {
            // Ordered list following the argument order
            let items: Vec<Value> = contributions
                .into_iter()
                .map(|(name, context)| {
                    json!({
                        "worker": name,
                        "milestones": context.as_ref().map(|c| c.completed_milestones.clone()),
                        "decisions": context.map(|c| c.decisions),
                    })
                })
                .collect();
            Value::Array(items)
        }
        "overlay" => {
            // Last-wins over an ordered key space
            let mut overlay = serde_json::Map::new();
            for (_, context) in contributions {
                if let Some(context) = context {
                    if let Value::Object(map) = serde_json::to_value(&context)? {
                        for (key, value) in map {
                            overlay.insert(key, value);
                        }
                    }
                }
            }
            Value::Object(overlay)
        }
        other => {
            return Err(OrchestratorError::invalid_argument(
                "strategy",
                format!("unknown merge strategy '{other}'"),
            ))
        }
    };

    Ok(json!({ "success": true, "strategy": params.strategy, "merged": merged }))
}

async fn execute_parallel(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: ExecuteParallelRequest = parse_args(arguments)?;
    if params.tasks.is_empty() {
        return Err(OrchestratorError::invalid_argument("tasks", "cannot be empty"));
    }

    let mut submitted = Vec::new();
    for spec in params.tasks {
        let (task_type, worker_name) = match spec.assign_to {
            Some(reference) => {
                let worker_id = runtime.resolve_worker(&reference).await?;
                let snapshot = runtime
                    .worker_manager
                    .snapshot(worker_id)
                    .await
                    .ok_or_else(|| OrchestratorError::WorkerNotFound(reference))?;
                (snapshot.worker_type, Some(snapshot.name))
            }
            None => ("dev".to_string(), None),
        };

        let task = Task::new(spec.description.clone(), task_type)
            .with_payload(Value::String(spec.description));
        let status = task.status;
        let task_id = runtime.graph.submit(task).await?;
        let current = runtime.graph.get(task_id).await.map(|t| t.status).unwrap_or(status);
        submitted.push(json!({
            "task_id": task_id,
            "worker_name": worker_name,
            "status": current.as_str(),
        }));
    }
    Ok(json!({ "success": true, "tasks": submitted }))
}

async fn save_session(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: SaveSessionRequest = parse_args(arguments)?;
    if params.name.trim().is_empty() {
        return Err(OrchestratorError::invalid_argument("name", "cannot be empty"));
    }

    let workers: Vec<Value> = runtime
        .worker_manager
        .list_workers()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "worker_id": s.worker_id,
                "name": s.name,
                "type": s.worker_type,
            })
        })
        .collect();
    let open_tasks: Vec<Value> = runtime
        .graph
        .list(&TaskFilter::default())
        .await
        .into_iter()
        .filter(|t| !t.is_terminal())
        .map(|t| {
            json!({
                "task_id": t.id,
                "name": t.name,
                "type": t.task_type,
                "status": t.status.as_str(),
            })
        })
        .collect();
    let quick_access: Vec<Value> = runtime
        .quick_access_map()
        .await
        .into_iter()
        .map(|(key, worker_id)| json!({ "key": key, "worker_id": worker_id }))
        .collect();

    let snapshot = json!({
        "name": params.name,
        "description": params.description,
        "saved_at": Utc::now(),
        "workers": workers,
        "open_tasks": open_tasks,
        "quick_access": quick_access,
    });
    runtime.memory.save_session(&params.name, &snapshot).await?;
    Ok(json!({ "success": true }))
}

async fn restore_session(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: RestoreSessionRequest = parse_args(arguments)?;
    let snapshot = runtime.memory.load_session(&params.name).await?;

    // Re-establish quick-access keys for workers that still exist
    let mut restored_keys = 0;
    if let Some(entries) = snapshot.get("quick_access").and_then(Value::as_array) {
        for entry in entries {
            let Some(worker_id) = entry
                .get("worker_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            if runtime.worker_manager.snapshot(worker_id).await.is_some()
                && runtime.assign_quick_key(worker_id).await.is_some()
            {
                restored_keys += 1;
            }
        }
    }

    Ok(json!({
        "success": true,
        "session": snapshot,
        "restored_quick_keys": restored_keys,
    }))
}

async fn natural_task(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: NaturalTaskRequest = parse_args(arguments)?;
    if params.input.trim().is_empty() {
        return Err(OrchestratorError::invalid_argument("input", "cannot be empty"));
    }

    // Prior successful commands for similar inputs feed the next steps
    let suggestions = runtime.memory.suggest_commands(&params.input, 3).await?;

    // Reuse an available worker or grow the pool
    let available = runtime.registry.available_agents().await;
    let (worker_id, worker_name) = match available.first() {
        Some(agent) => {
            let snapshot = runtime
                .worker_manager
                .snapshot(agent.id)
                .await
                .ok_or_else(|| OrchestratorError::WorkerNotFound(agent.id.to_string()))?;
            (snapshot.worker_id, snapshot.name)
        }
        None => {
            let (snapshot, _) = runtime.spawn_worker("dev", &params.input).await?;
            (snapshot.worker_id, snapshot.name)
        }
    };

    let mut payload = params.input.clone();
    if let Some(context) = &params.context {
        if !context.is_empty() {
            payload = format!("{payload}\nContext:\n{}", context.join("\n"));
        }
    }
    let task = Task::new(params.input.clone(), "dev").with_payload(Value::String(payload));
    let task_id = runtime.graph.submit(task).await?;

    let mut next_steps: Vec<String> = suggestions
        .iter()
        .map(|s| format!("previously worked: {}", s.command))
        .collect();
    next_steps.push(format!("worker_status {worker_name} to follow progress"));
    next_steps.push("status_rich for the full dashboard".to_string());

    Ok(json!({
        "success": true,
        "task_id": task_id,
        "worker_id": worker_id,
        "worker_name": worker_name,
        "instructions": params.input,
        "next_steps": next_steps,
    }))
}

async fn smart_connect(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let params: SmartConnectRequest = parse_args(arguments)?;

    let resolved = if params.fuzzy_match {
        runtime.resolve_worker(&params.target).await
    } else {
        match runtime.worker_manager.find_by_name(&params.target).await {
            Some(id) => Ok(id),
            None => match Uuid::parse_str(&params.target).ok() {
                Some(id) if runtime.worker_manager.snapshot(id).await.is_some() => Ok(id),
                _ => Err(OrchestratorError::WorkerNotFound(params.target.clone())),
            },
        }
    };

    match resolved {
        Ok(worker_id) => {
            let snapshot = runtime
                .worker_manager
                .snapshot(worker_id)
                .await
                .ok_or_else(|| OrchestratorError::WorkerNotFound(params.target.clone()))?;
            Ok(json!({
                "success": true,
                "worker_id": worker_id,
                "worker_name": snapshot.name,
                "status": snapshot.status.as_str(),
                "quick_access_key": runtime.quick_key_for(worker_id).await,
            }))
        }
        Err(_) => Ok(json!({
            "success": false,
            "suggestions": name_suggestions(runtime, &params.target).await,
        })),
    }
}

async fn status_rich(runtime: &Arc<OrchflowRuntime>, arguments: Value) -> OrchResult<Value> {
    let _params: StatusRichRequest = parse_args(arguments)?;

    let counts = runtime.graph.counts().await;
    let workers: Vec<Value> = runtime
        .worker_manager
        .list_workers()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "worker_id": s.worker_id,
                "name": s.name,
                "type": s.worker_type,
                "status": s.status.as_str(),
                "queued": s.queued,
                "paused": s.paused,
            })
        })
        .collect();
    let locks: Vec<Value> = runtime
        .locks
        .stats()
        .await
        .into_iter()
        .map(|s| serde_json::to_value(s).unwrap_or_default())
        .collect();
    let circuits: Vec<Value> = runtime
        .breaker
        .stats()
        .await
        .into_iter()
        .map(|s| serde_json::to_value(s).unwrap_or_default())
        .collect();
    let swarms: Vec<Value> = runtime
        .swarm
        .list()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "swarm_id": s.id,
                "name": s.name,
                "shape": s.shape.as_str(),
                "status": s.status.as_str(),
                "succeeded": s.results.len(),
                "failed": s.errors.len(),
            })
        })
        .collect();
    let recent_events: Vec<Value> = runtime
        .event_bus
        .recent(20)
        .await
        .into_iter()
        .map(|e| {
            json!({
                "sequence": e.sequence.0,
                "timestamp": e.timestamp,
                "kind": e.payload.kind(),
            })
        })
        .collect();

    Ok(json!({
        "success": true,
        "tasks": {
            "pending": counts.pending,
            "scheduled": counts.scheduled,
            "running": counts.running,
            "completed": counts.completed,
            "failed": counts.failed,
            "cancelled": counts.cancelled,
        },
        "workers": workers,
        "locks": locks,
        "circuits": circuits,
        "swarms": swarms,
        "metrics": serde_json::to_value(runtime.metrics.snapshot())?,
        "recent_events": recent_events,
        "scheduler_discipline": runtime.scheduler.discipline().await.as_str(),
        "balancer_discipline": runtime.balancer.discipline().await.as_str(),
    }))
}
