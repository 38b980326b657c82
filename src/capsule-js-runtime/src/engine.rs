//! The interpreter loop: one fresh QuickJS context per worker, driven by the
//! host message channel.
//!
//! The lifecycle follows the wire protocol exactly: receive `init`, build
//! the context (bridge hooks, bootstrap, policy preamble, adapter proxies,
//! env, injected globals), reply `ready`, receive `execute`, then pump the
//! job queue against the command channel until the run's promise settles.
//! Multiple adapter calls can be in flight at once; replies resolve by id,
//! not arrival order.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use capsule_js_common::message::{HostMessage, WorkerInit, WorkerMessage};
use capsule_js_common::result::{ErrorDetail, RunOutcome};
use capsule_js_common::MAX_STACK_FRAMES;
use rquickjs::function::Func;
use rquickjs::promise::{Promise, PromiseState};
use rquickjs::{CatchResultExt, CaughtError, Coerced, Context, Ctx, FromJs, Function, Runtime, Value};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// Stack ceiling for the interpreter.
const MAX_STACK_SIZE: usize = 1024 * 1024;

/// How long one pump iteration blocks on the command channel.
const PUMP_POLL: Duration = Duration::from_millis(10);

/// Global slot holding the run's promise between context entries.
const RUN_SLOT: &str = "__capsule_run";

trait CatchJsExt {
    type Output;
    fn catch_js(self, ctx: &Ctx<'_>) -> anyhow::Result<Self::Output>;
}

impl<T> CatchJsExt for rquickjs::Result<T> {
    type Output = T;
    fn catch_js(self, ctx: &Ctx<'_>) -> anyhow::Result<T> {
        match CatchResultExt::catch(self, ctx) {
            Ok(value) => Ok(value),
            Err(caught) => Err(anyhow!("Runtime error: {caught:#?}")),
        }
    }
}

/// Thread entry point. Engine-level failures become a single `fatal` event.
pub(crate) fn run(
    commands: Receiver<HostMessage>,
    events: UnboundedSender<WorkerMessage>,
    interrupt: Arc<AtomicBool>,
) {
    if let Err(error) = run_inner(&commands, &events, &interrupt) {
        let _ = events.send(WorkerMessage::Fatal {
            message: format!("{error:#}"),
        });
    }
}

fn run_inner(
    commands: &Receiver<HostMessage>,
    events: &UnboundedSender<WorkerMessage>,
    interrupt: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let init = match commands.recv() {
        Ok(HostMessage::Init(init)) => init,
        Ok(other) => return Err(anyhow!("protocol error: expected init, got {other:?}")),
        // Host went away before init; nothing to do.
        Err(_) => return Ok(()),
    };

    let runtime = Runtime::new().context("initializing the QuickJS runtime")?;
    if let Some(limit) = init.memory_limit_bytes {
        runtime.set_memory_limit(limit);
    }
    runtime.set_max_stack_size(MAX_STACK_SIZE);
    {
        let interrupt = Arc::clone(interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.load(Ordering::Relaxed))));
    }
    let context = Context::full(&runtime).context("creating the JS context")?;

    let logs: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    context.with(|ctx| install(&ctx, &init, &logs, events.clone()))?;

    let _ = events.send(WorkerMessage::Ready);

    let code = loop {
        match commands.recv() {
            Ok(HostMessage::Execute { code }) => break code,
            Ok(other) => {
                debug!(received = ?other, "ignoring message received before execute");
            }
            Err(_) => return Ok(()),
        }
    };

    if let Some(outcome) = execute(&runtime, &context, commands, &init, &logs, interrupt, &code)? {
        let _ = events.send(WorkerMessage::Result(outcome));
    }
    Ok(())
}

/// Install the sandbox environment in dependency order: native hooks first
/// (the bootstrap captures and hides them), then the bootstrap, then the
/// network policy preamble, then the adapter proxies, env record and
/// injected globals.
fn install<'js>(
    ctx: &Ctx<'js>,
    init: &WorkerInit,
    logs: &Rc<RefCell<Vec<String>>>,
    events: UnboundedSender<WorkerMessage>,
) -> anyhow::Result<()> {
    let globals = ctx.globals();

    globals
        .set(
            "__capsule_emit",
            Func::from(
                move |id: f64, adapter: String, method: String, args_json: String| {
                    let args: Vec<JsonValue> =
                        serde_json::from_str(&args_json).unwrap_or_default();
                    let _ = events.send(WorkerMessage::AdapterCall {
                        id: id as u64,
                        adapter,
                        method,
                        args,
                    });
                },
            ),
        )
        .catch_js(ctx)?;

    {
        let logs = Rc::clone(logs);
        let max_lines = init.max_log_lines;
        globals
            .set(
                "__capsule_log",
                Func::from(move |level: String, text: String| {
                    let mut logs = logs.borrow_mut();
                    if logs.len() < max_lines {
                        logs.push(format!("[{level}] {text}"));
                    } else if logs.len() == max_lines {
                        logs.push("[warn] log output truncated".to_string());
                    }
                }),
            )
            .catch_js(ctx)?;
    }

    ctx.eval::<(), _>(BOOTSTRAP_JS).catch_js(ctx)?;
    if !init.preamble.is_empty() {
        ctx.eval::<(), _>(init.preamble.as_str()).catch_js(ctx)?;
    }

    let catalog = serde_json::to_string(&init.adapters)?;
    ctx.eval::<(), _>(format!("__install_adapters({catalog});"))
        .catch_js(ctx)?;
    let env = serde_json::to_string(&init.env)?;
    ctx.eval::<(), _>(format!("__install_env({env});"))
        .catch_js(ctx)?;

    for (name, value) in &init.globals {
        let parsed = ctx
            .json_parse(serde_json::to_string(value)?)
            .catch_js(ctx)?;
        globals.set(name.as_str(), parsed).catch_js(ctx)?;
    }
    Ok(())
}

type RunResult = Result<Option<JsonValue>, ErrorDetail>;

fn execute(
    runtime: &Runtime,
    context: &Context,
    commands: &Receiver<HostMessage>,
    init: &WorkerInit,
    logs: &Rc<RefCell<Vec<String>>>,
    interrupt: &Arc<AtomicBool>,
    code: &str,
) -> anyhow::Result<Option<RunOutcome>> {
    // The snippet becomes the body of a fresh callable. This is the sole
    // dynamic code synthesis in the system, gated by the analyzer and the
    // isolation boundary around this context.
    if !init.allow_async {
        let wrapped = format!("(() => {{\n{code}\n}})()");
        let result = context.with(|ctx| -> anyhow::Result<RunResult> {
            match CatchResultExt::catch(ctx.eval::<Value, _>(wrapped.as_str()), &ctx) {
                Ok(value) => Ok(Ok(value_to_json(&ctx, value)?)),
                Err(caught) => Ok(Err(detail_from_caught(&ctx, caught))),
            }
        })?;
        return Ok(Some(outcome_from(result, logs)));
    }

    let wrapped = format!("(async () => {{\n{code}\n}})()");
    let immediate_error = context.with(|ctx| -> anyhow::Result<Option<ErrorDetail>> {
        match CatchResultExt::catch(ctx.eval::<Promise, _>(wrapped.as_str()), &ctx) {
            Ok(promise) => {
                ctx.globals().set(RUN_SLOT, promise).catch_js(&ctx)?;
                Ok(None)
            }
            Err(caught) => Ok(Some(detail_from_caught(&ctx, caught))),
        }
    })?;
    if let Some(detail) = immediate_error {
        return Ok(Some(outcome_from(Err(detail), logs)));
    }

    loop {
        drain_jobs(runtime);

        let settled = context.with(|ctx| -> anyhow::Result<Option<RunResult>> {
            let promise: Promise = ctx.globals().get(RUN_SLOT).catch_js(&ctx)?;
            match promise.state() {
                PromiseState::Pending => Ok(None),
                _ => match promise.result::<Value>() {
                    None => Ok(None),
                    Some(Ok(value)) => Ok(Some(Ok(value_to_json(&ctx, value)?))),
                    Some(Err(error)) => {
                        let detail =
                            match CatchResultExt::catch(Err::<(), _>(error), &ctx) {
                                Err(caught) => detail_from_caught(&ctx, caught),
                                Ok(()) => ErrorDetail::new("Error", "promise rejected"),
                            };
                        Ok(Some(Err(detail)))
                    }
                },
            }
        })?;

        if let Some(result) = settled {
            return Ok(Some(outcome_from(result, logs)));
        }
        // Host-side termination: stop without reporting. The host has
        // already resolved the run and discards anything stale.
        if interrupt.load(Ordering::Relaxed) {
            return Ok(None);
        }

        match commands.recv_timeout(PUMP_POLL) {
            Ok(HostMessage::AdapterResult { id, result, error }) => {
                deliver(context, id, result, error)?;
            }
            Ok(other) => {
                debug!(received = ?other, "ignoring unexpected message mid-run");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(None),
        }
    }
}

/// Run queued jobs (microtasks, settled continuations) to quiescence. A job
/// that throws has still been consumed, so the loop always terminates.
fn drain_jobs(runtime: &Runtime) {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(_) => continue,
        }
    }
}

/// Resolve or reject the pending call registered under `id`.
fn deliver(
    context: &Context,
    id: u64,
    result: Option<JsonValue>,
    error: Option<String>,
) -> anyhow::Result<()> {
    context.with(|ctx| -> anyhow::Result<()> {
        let deliver: Function = ctx.globals().get("__deliver").catch_js(&ctx)?;
        match error {
            Some(message) => {
                deliver
                    .call::<_, ()>((id as f64, false, Some(message)))
                    .catch_js(&ctx)?;
            }
            None => {
                let payload = match result {
                    Some(value) => Some(serde_json::to_string(&value)?),
                    None => None,
                };
                deliver
                    .call::<_, ()>((id as f64, true, payload))
                    .catch_js(&ctx)?;
            }
        }
        Ok(())
    })
}

fn value_to_json<'a>(ctx: &Ctx<'a>, value: Value<'a>) -> anyhow::Result<Option<JsonValue>> {
    if value.is_undefined() {
        return Ok(None);
    }
    let Some(text) = ctx.json_stringify(value).catch_js(ctx)? else {
        // JSON.stringify yields undefined for functions and symbols.
        return Ok(None);
    };
    let text = text.to_string().catch_js(ctx)?;
    Ok(Some(serde_json::from_str(&text)?))
}

fn truncate_stack(stack: &str) -> Vec<String> {
    stack
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .take(MAX_STACK_FRAMES)
        .collect()
}

fn detail_from_caught<'a>(ctx: &Ctx<'a>, caught: CaughtError<'a>) -> ErrorDetail {
    match caught {
        CaughtError::Exception(exception) => {
            let name = exception
                .get::<_, Option<Coerced<String>>>("name")
                .ok()
                .flatten()
                .map(|coerced| coerced.0)
                .unwrap_or_else(|| "Error".to_string());
            let message = exception.message().unwrap_or_default();
            let stack = exception
                .stack()
                .map(|stack| truncate_stack(&stack))
                .unwrap_or_default();
            ErrorDetail {
                name,
                message,
                stack,
            }
        }
        CaughtError::Value(value) => {
            let message = Coerced::<String>::from_js(ctx, value)
                .map(|coerced| coerced.0)
                .unwrap_or_else(|_| "unknown error".to_string());
            ErrorDetail::new("Error", message)
        }
        CaughtError::Error(error) => ErrorDetail::new("Error", error.to_string()),
    }
}

fn outcome_from(result: RunResult, logs: &Rc<RefCell<Vec<String>>>) -> RunOutcome {
    let logs = logs.borrow().clone();
    match result {
        Ok(value) => RunOutcome {
            success: true,
            value,
            error: None,
            logs,
        },
        Err(detail) => RunOutcome {
            success: false,
            value: None,
            error: Some(detail),
            logs,
        },
    }
}
