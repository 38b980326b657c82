//! The sandbox orchestrator: one call in, one resolved result out.
//!
//! A run moves through `created → analyzed → worker-initializing →
//! worker-ready → executing → {resolved | timed-out | errored}`. Terminal
//! states release the worker exactly once: the handle is dropped on every
//! exit path, which sets the interrupt flag and closes the command channel.
//! A single timer owns cancellation; when it fires the run resolves as a
//! timeout no matter how close the worker was to finishing, and anything
//! the worker still sends afterwards is discarded with the dropped channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use capsule_js_common::config::{NetworkPolicy, SandboxSettings};
use capsule_js_common::message::{HostMessage, WorkerInit, WorkerMessage};
use capsule_js_common::result::{ErrorDetail, ExecutionResult, FailureKind, RunOutcome};
use capsule_js_common::MAX_LOG_LINES;
use capsule_js_runtime::Worker;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{instrument, Level};

use crate::adapter::{AdapterRegistry, DispatchError};
use crate::analyze;
use crate::fetch::{FetchRequest, HttpClient, OutboundHttp};
use crate::normalize;
use crate::policy::{self, NET_ADAPTER};
use crate::skill::Skill;
use crate::summarize::{summarize_value, Limits};

use super::metrics::{
    WorkerMetricsGuard, METRIC_ADAPTER_CALLS, METRIC_ANALYSIS_REJECTIONS, METRIC_RUNS_TOTAL,
    METRIC_RUN_TIMEOUTS,
};

/// Executes snippets under one sandbox configuration.
pub struct Sandbox {
    settings: SandboxSettings,
    adapters: Arc<AdapterRegistry>,
    env: std::collections::BTreeMap<String, String>,
    http: Arc<dyn OutboundHttp>,
}

impl Sandbox {
    /// Build a sandbox over the given adapter registry.
    pub fn new(settings: SandboxSettings, adapters: Arc<AdapterRegistry>) -> Self {
        Self {
            settings,
            adapters,
            env: Default::default(),
            http: Arc::new(HttpClient::new()),
        }
    }

    /// Set the read-only environment record the sandbox exposes.
    pub fn with_env(mut self, env: std::collections::BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Replace the outbound HTTP capability (tests stub it here).
    pub fn with_outbound_http(mut self, http: Arc<dyn OutboundHttp>) -> Self {
        self.http = http;
        self
    }

    /// The active settings.
    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// The adapter registry this sandbox serves.
    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    /// Execute a snippet with the internal summarizer defaults.
    #[instrument(skip_all, level = Level::INFO)]
    pub async fn execute(&self, code: &str) -> ExecutionResult {
        self.execute_with(code, Limits::default()).await
    }

    /// Execute a snippet with explicit truncation parameters.
    #[instrument(skip_all, level = Level::INFO)]
    pub async fn execute_with(&self, code: &str, limits: Limits) -> ExecutionResult {
        let started = Instant::now();
        metrics::counter!(METRIC_RUNS_TOTAL).increment(1);
        let mut logs: Vec<String> = Vec::new();

        let code = if self.settings.normalize {
            match normalize::normalize(code) {
                Ok(normalized) => normalized.code,
                Err(error) => {
                    return ExecutionResult::err(
                        ErrorDetail::for_kind(FailureKind::Syntax, error.to_string()),
                        logs,
                        elapsed_ms(started),
                    );
                }
            }
        } else {
            code.trim().to_string()
        };

        // Nothing to run; no worker is spawned.
        if code.is_empty() {
            return ExecutionResult::ok(None, logs, elapsed_ms(started));
        }

        if self.settings.analysis.enabled {
            match analyze::analyze(&code, &self.settings.analysis) {
                Ok(report) => {
                    for warning in &report.warnings {
                        logs.push(warning.to_log_line());
                    }
                    if report.has_errors() {
                        for error in &report.errors {
                            logs.push(error.to_log_line());
                        }
                        if self.settings.analysis.block_on_error {
                            metrics::counter!(METRIC_ANALYSIS_REJECTIONS).increment(1);
                            let first = &report.errors[0];
                            let message = format!(
                                "{}: {} (line {}, column {})",
                                first.rule, first.message, first.line, first.column
                            );
                            return ExecutionResult::err(
                                ErrorDetail::for_kind(FailureKind::Analysis, message),
                                logs,
                                elapsed_ms(started),
                            );
                        }
                    }
                }
                Err(error) => {
                    return ExecutionResult::err(
                        ErrorDetail::for_kind(FailureKind::Syntax, error.to_string()),
                        logs,
                        elapsed_ms(started),
                    );
                }
            }
        }

        match self.run_worker(&code).await {
            Ok(outcome) => {
                logs.extend(outcome.logs);
                if outcome.success {
                    let mut truncated = false;
                    let value = outcome.value.map(|value| {
                        let (bounded, cut) = summarize_value(&value, limits);
                        truncated = cut;
                        bounded
                    });
                    ExecutionResult::ok(value, logs, elapsed_ms(started)).truncated(truncated)
                } else {
                    let error = outcome.error.unwrap_or_else(|| {
                        ErrorDetail::for_kind(FailureKind::Runtime, "user code failed")
                    });
                    ExecutionResult::err(error, logs, elapsed_ms(started))
                }
            }
            Err(detail) => ExecutionResult::err(detail, logs, elapsed_ms(started)),
        }
    }

    /// The worker phase: spawn, handshake, execute, and race the timer.
    async fn run_worker(&self, code: &str) -> Result<RunOutcome, ErrorDetail> {
        let _metrics_guard = WorkerMetricsGuard::new();

        let mut worker = Worker::spawn().map_err(|error| {
            ErrorDetail::for_kind(FailureKind::Worker, format!("failed to spawn worker: {error}"))
        })?;
        let Some(mut events) = worker.take_events() else {
            return Err(ErrorDetail::for_kind(
                FailureKind::Worker,
                "worker event channel unavailable",
            ));
        };

        let init = WorkerInit {
            preamble: policy::generate_preamble(&self.settings.network_policy),
            adapters: self.adapters.catalog(),
            globals: self.settings.globals.clone(),
            env: self.env.clone(),
            allow_async: self.settings.allow_async,
            memory_limit_bytes: self
                .settings
                .memory_hint_mb
                .map(|mb| (mb as usize).saturating_mul(1024 * 1024)),
            max_log_lines: MAX_LOG_LINES,
        };
        if !worker.send(HostMessage::Init(init)) {
            return Err(ErrorDetail::for_kind(
                FailureKind::Worker,
                "worker terminated before init",
            ));
        }

        let timer = sleep(Duration::from_millis(self.settings.timeout_ms));
        tokio::pin!(timer);
        let mut ready = false;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(WorkerMessage::Ready) if !ready => {
                        ready = true;
                        if !worker.send(HostMessage::Execute { code: code.to_string() }) {
                            worker.terminate();
                            return Err(ErrorDetail::for_kind(
                                FailureKind::Worker,
                                "worker terminated before execute",
                            ));
                        }
                    }
                    Some(WorkerMessage::Ready) => {}
                    Some(WorkerMessage::AdapterCall { id, adapter, method, args }) => {
                        self.dispatch_adapter_call(&worker, id, adapter, method, args);
                    }
                    Some(WorkerMessage::Result(outcome)) => {
                        worker.terminate();
                        return Ok(outcome);
                    }
                    Some(WorkerMessage::Fatal { message }) => {
                        worker.terminate();
                        return Err(ErrorDetail::for_kind(FailureKind::Worker, message));
                    }
                    None => {
                        worker.terminate();
                        return Err(ErrorDetail::for_kind(
                            FailureKind::Worker,
                            "worker channel closed unexpectedly",
                        ));
                    }
                },
                _ = &mut timer => {
                    metrics::counter!(METRIC_RUN_TIMEOUTS).increment(1);
                    worker.terminate();
                    return Err(ErrorDetail::for_kind(
                        FailureKind::Timeout,
                        format!("execution exceeded the {} ms budget", self.settings.timeout_ms),
                    ));
                }
            }
        }
    }

    /// Answer one `adapter-call` concurrently; replies may land in any
    /// order. Sends to a worker that has since terminated just fail.
    fn dispatch_adapter_call(
        &self,
        worker: &Worker,
        id: u64,
        adapter: String,
        method: String,
        args: Vec<Value>,
    ) {
        metrics::counter!(METRIC_ADAPTER_CALLS).increment(1);
        let reply = worker.command_sender();

        if adapter == NET_ADAPTER {
            let policy = self.settings.network_policy.clone();
            let http = Arc::clone(&self.http);
            tokio::spawn(async move {
                let message = match net_fetch(&policy, http, &method, &args).await {
                    Ok(value) => HostMessage::AdapterResult {
                        id,
                        result: Some(value),
                        error: None,
                    },
                    Err(error) => HostMessage::AdapterResult {
                        id,
                        result: None,
                        error: Some(error),
                    },
                };
                let _ = reply.send(message);
            });
            return;
        }

        let registry = Arc::clone(&self.adapters);
        tokio::spawn(async move {
            let message = match registry.dispatch(&adapter, &method, args).await {
                Ok(value) => HostMessage::AdapterResult {
                    id,
                    result: Some(value),
                    error: None,
                },
                Err(error @ DispatchError::MethodNotFound { .. }) => HostMessage::AdapterResult {
                    id,
                    result: None,
                    error: Some(error.to_string()),
                },
                Err(DispatchError::Failed(message)) => HostMessage::AdapterResult {
                    id,
                    result: None,
                    error: Some(message),
                },
            };
            let _ = reply.send(message);
        });
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("timeout_ms", &self.settings.timeout_ms)
            .field("network_policy", &self.settings.network_policy)
            .finish()
    }
}

/// The host half of sandbox `fetch`: validate against the policy, then
/// perform the request.
async fn net_fetch(
    policy: &NetworkPolicy,
    http: Arc<dyn OutboundHttp>,
    method: &str,
    args: &[Value],
) -> Result<Value, String> {
    if method != "fetch" {
        return Err(format!("method not found: {NET_ADAPTER}.{method}"));
    }
    let request = FetchRequest::from_bridge_args(args)?;
    if !policy::is_url_allowed(&request.url, policy) {
        return Err(match policy {
            NetworkPolicy::Blocked => policy::NETWORK_BLOCKED_MESSAGE.to_string(),
            _ => format!(
                "Network access blocked: {} is not allowed by the network policy",
                request.url
            ),
        });
    }
    let response = http.fetch(request).await?;
    serde_json::to_value(&response).map_err(|error| error.to_string())
}

/// Run a named task under its timeout, summarizing like any other run.
#[instrument(skip_all, fields(task = %skill.name), level = Level::INFO)]
pub async fn run_named_task(
    skill: &Skill,
    inputs: Option<Value>,
    adapters: Arc<AdapterRegistry>,
    default_timeout_ms: u64,
    limits: Limits,
) -> ExecutionResult {
    let started = Instant::now();
    let timeout_ms = skill.timeout_ms.unwrap_or(default_timeout_ms);
    let merged = skill.merged_inputs(inputs);

    let run = skill.run(merged, adapters);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
        Err(_) => ExecutionResult::err(
            ErrorDetail::for_kind(
                FailureKind::Timeout,
                format!("task exceeded the {timeout_ms} ms budget"),
            ),
            Vec::new(),
            elapsed_ms(started),
        ),
        Ok(Err(message)) => ExecutionResult::err(
            ErrorDetail::for_kind(FailureKind::Runtime, message),
            Vec::new(),
            elapsed_ms(started),
        ),
        Ok(Ok(value)) => {
            let (bounded, truncated) = summarize_value(&value, limits);
            ExecutionResult::ok(Some(bounded), Vec::new(), elapsed_ms(started))
                .truncated(truncated)
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
