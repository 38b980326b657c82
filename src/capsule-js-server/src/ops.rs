//! The four protocol operations, independent of transport.
//!
//! Every operation resolves to a textual summary for the calling model plus
//! a structured payload for programmatic consumers. The global response
//! ceiling applies to the summary as the final pass, after the per-level
//! value caps have already run inside the engine.

use std::sync::Arc;

use capsule_js::summarize::{
    enforce_response_ceiling, Limits, DEFAULT_MAX_STRING_LENGTH, EXECUTE_MAX_ITEMS,
    LIST_MAX_ITEMS, MAX_RESPONSE_CHARS,
};
use capsule_js::{run_named_task, AdapterRegistry, Sandbox, SkillRegistry};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{instrument, Level};

/// A transport-independent operation failure.
#[derive(Debug, Clone)]
pub struct OpError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl OpError {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }
}

/// A resolved operation: summary text plus structured payload.
#[derive(Debug, Clone)]
pub struct OpReply {
    /// Text for humans and LLMs.
    pub summary: String,
    /// Structured payload for programmatic consumers.
    pub payload: Value,
}

impl OpReply {
    fn new(summary: String, payload: Value) -> Self {
        let (summary, _) = enforce_response_ceiling(&summary, MAX_RESPONSE_CHARS);
        Self { summary, payload }
    }
}

/// Parameters of `execute`.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecuteParams {
    /// Source snippet.
    pub code: String,
    /// Whether summarization applies at all.
    pub truncate: bool,
    /// Array head kept per level.
    pub max_items: usize,
    /// Characters kept per string.
    pub max_string_length: usize,
}

impl Default for ExecuteParams {
    fn default() -> Self {
        Self {
            code: String::new(),
            truncate: true,
            max_items: EXECUTE_MAX_ITEMS,
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
        }
    }
}

/// Parameters of `list`.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListParams {
    /// Whether entry sampling applies.
    pub truncate: bool,
    /// Entries kept per section.
    pub max_items: usize,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            truncate: true,
            max_items: LIST_MAX_ITEMS,
        }
    }
}

/// What `search` looks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    /// Adapters, methods and tasks.
    #[default]
    All,
    /// Adapter names and descriptions only.
    Adapters,
    /// Method names, descriptions and signatures.
    Methods,
    /// Named tasks.
    Tasks,
}

/// Parameters of `search`.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchParams {
    /// Case-insensitive substring to look for.
    pub query: String,
    /// Entity filter.
    #[serde(rename = "type")]
    pub kind: SearchKind,
    /// Maximum results.
    pub limit: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            kind: SearchKind::All,
            limit: LIST_MAX_ITEMS,
        }
    }
}

/// Parameters of `run-named-task`.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunTaskParams {
    /// Task name.
    pub name: String,
    /// Inputs record.
    pub inputs: Option<Value>,
    /// Whether summarization applies.
    pub truncate: bool,
    /// Array head kept per level.
    pub max_items: usize,
    /// Characters kept per string.
    pub max_string_length: usize,
}

impl Default for RunTaskParams {
    fn default() -> Self {
        Self {
            name: String::new(),
            inputs: None,
            truncate: true,
            max_items: EXECUTE_MAX_ITEMS,
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
        }
    }
}

fn limits_from(truncate: bool, max_items: usize, max_string_length: usize) -> Limits {
    if truncate {
        Limits {
            max_items,
            max_string_length,
        }
    } else {
        Limits {
            max_items: usize::MAX,
            max_string_length: usize::MAX,
        }
    }
}

/// The protocol surface: the sandbox plus both registries.
pub struct Service {
    sandbox: Sandbox,
    adapters: Arc<AdapterRegistry>,
    skills: Arc<SkillRegistry>,
}

impl Service {
    /// Compose the surface.
    pub fn new(sandbox: Sandbox, adapters: Arc<AdapterRegistry>, skills: Arc<SkillRegistry>) -> Self {
        Self {
            sandbox,
            adapters,
            skills,
        }
    }

    /// `execute(code, truncation-knobs)`.
    #[instrument(skip_all, level = Level::INFO)]
    pub async fn execute(&self, params: ExecuteParams) -> Result<OpReply, OpError> {
        let limits = limits_from(params.truncate, params.max_items, params.max_string_length);
        let result = self.sandbox.execute_with(&params.code, limits).await;

        let mut summary = if result.success {
            let rendered = match &result.value {
                Some(value) => serde_json::to_string_pretty(value)
                    .unwrap_or_else(|_| "<unrenderable>".to_string()),
                None => "undefined".to_string(),
            };
            format!(
                "Execution succeeded in {} ms.\nResult:\n{rendered}",
                result.execution_time_ms
            )
        } else {
            let error = result.error.clone().unwrap_or_default();
            format!(
                "Execution failed ({}): {}",
                error.name, error.message
            )
        };
        if !result.logs.is_empty() {
            summary.push_str("\nLogs:\n");
            summary.push_str(&result.logs.join("\n"));
        }

        let payload = serde_json::to_value(&result)
            .map_err(|e| OpError::invalid_params(e.to_string()))?;
        Ok(OpReply::new(summary, payload))
    }

    /// `list(truncation-knobs)`.
    #[instrument(skip_all, level = Level::INFO)]
    pub async fn list(&self, params: ListParams) -> Result<OpReply, OpError> {
        let max_items = if params.truncate {
            params.max_items
        } else {
            usize::MAX
        };

        let adapters = self.adapters.enumerate();
        let skills = self.skills.enumerate();
        let method_count: usize = adapters.iter().map(|a| a.methods().count()).sum();

        let mut adapter_entries = Vec::new();
        for adapter in adapters.iter().take(max_items) {
            adapter_entries.push(json!({
                "name": adapter.name,
                "description": adapter.description,
                "version": adapter.version,
                "methods": adapter
                    .methods()
                    .take(max_items)
                    .map(|m| m.signature())
                    .collect::<Vec<_>>(),
            }));
        }
        let task_entries: Vec<Value> = skills
            .iter()
            .take(max_items)
            .map(|skill| {
                json!({
                    "name": skill.name,
                    "description": skill.description,
                    "inputs": skill.inputs.keys().collect::<Vec<_>>(),
                })
            })
            .collect();

        let mut summary = format!(
            "{} adapters ({} methods), {} named tasks.",
            adapters.len(),
            method_count,
            skills.len()
        );
        for adapter in adapters.iter().take(max_items) {
            summary.push_str(&format!(
                "\n- {}: {}",
                adapter.name,
                adapter.description.as_deref().unwrap_or("(no description)")
            ));
            for method in adapter.methods().take(max_items) {
                summary.push_str(&format!("\n    {}.{}", adapter.name, method.signature()));
            }
        }
        for skill in skills.iter().take(max_items) {
            summary.push_str(&format!(
                "\n- task {}: {}",
                skill.name,
                skill.description.as_deref().unwrap_or("(no description)")
            ));
        }

        let payload = json!({
            "adapter_count": adapters.len(),
            "method_count": method_count,
            "task_count": skills.len(),
            "adapters": adapter_entries,
            "tasks": task_entries,
        });
        Ok(OpReply::new(summary, payload))
    }

    /// `search(query, type-filter, limit)`.
    #[instrument(skip_all, fields(query = %params.query), level = Level::INFO)]
    pub async fn search(&self, params: SearchParams) -> Result<OpReply, OpError> {
        if params.query.trim().is_empty() {
            return Err(OpError::invalid_params("search requires a non-empty query"));
        }
        let needle = params.query.to_lowercase();
        let matches_text =
            |text: &str| -> bool { text.to_lowercase().contains(needle.as_str()) };

        let mut results: Vec<Value> = Vec::new();
        for adapter in self.adapters.enumerate() {
            if matches!(params.kind, SearchKind::All | SearchKind::Adapters)
                && (matches_text(&adapter.name)
                    || adapter.description.as_deref().is_some_and(matches_text))
            {
                results.push(json!({
                    "kind": "adapter",
                    "name": adapter.name,
                    "description": adapter.description,
                }));
            }
            if matches!(params.kind, SearchKind::All | SearchKind::Methods) {
                for method in adapter.methods() {
                    if matches_text(&method.name) || matches_text(&method.description) {
                        results.push(json!({
                            "kind": "method",
                            "name": format!("{}.{}", adapter.name, method.name),
                            "description": method.description,
                            "signature": format!("{}.{}", adapter.name, method.signature()),
                        }));
                    }
                }
            }
        }
        if matches!(params.kind, SearchKind::All | SearchKind::Tasks) {
            for skill in self.skills.enumerate() {
                if matches_text(&skill.name)
                    || skill.description.as_deref().is_some_and(matches_text)
                {
                    results.push(json!({
                        "kind": "task",
                        "name": skill.name,
                        "description": skill.description,
                    }));
                }
            }
        }

        let total = results.len();
        results.truncate(params.limit);

        let mut summary = format!("{total} results for {:?}.", params.query);
        for result in &results {
            let kind = result["kind"].as_str().unwrap_or("?");
            let name = result["name"].as_str().unwrap_or("?");
            match result.get("signature").and_then(Value::as_str) {
                Some(signature) => summary.push_str(&format!("\n- [{kind}] {signature}")),
                None => summary.push_str(&format!("\n- [{kind}] {name}")),
            }
        }
        if total > results.len() {
            summary.push_str(&format!("\n... ({} more results)", total - results.len()));
        }

        let payload = json!({ "total": total, "results": results });
        Ok(OpReply::new(summary, payload))
    }

    /// `run-named-task(name, inputs, truncation-knobs)`.
    #[instrument(skip_all, fields(task = %params.name), level = Level::INFO)]
    pub async fn run_task(&self, params: RunTaskParams) -> Result<OpReply, OpError> {
        let Some(skill) = self.skills.lookup(&params.name) else {
            return Err(OpError::invalid_params(format!(
                "unknown task: {:?}",
                params.name
            )));
        };
        let limits = limits_from(params.truncate, params.max_items, params.max_string_length);
        let result = run_named_task(
            &skill,
            params.inputs,
            Arc::clone(&self.adapters),
            self.sandbox.settings().timeout_ms,
            limits,
        )
        .await;

        let summary = if result.success {
            let rendered = match &result.value {
                Some(value) => serde_json::to_string_pretty(value)
                    .unwrap_or_else(|_| "<unrenderable>".to_string()),
                None => "undefined".to_string(),
            };
            format!(
                "Task {} finished in {} ms.\nResult:\n{rendered}",
                skill.name, result.execution_time_ms
            )
        } else {
            let error = result.error.clone().unwrap_or_default();
            format!("Task {} failed ({}): {}", skill.name, error.name, error.message)
        };

        let payload = serde_json::to_value(&result)
            .map_err(|e| OpError::invalid_params(e.to_string()))?;
        Ok(OpReply::new(summary, payload))
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("adapters", &self.adapters.len())
            .field("tasks", &self.skills.len())
            .finish()
    }
}
