//! The isolated interpreter worker for capsule-js.
//!
//! Each [`Worker`] owns a freshly created QuickJS context on a dedicated OS
//! thread. The host communicates with it exclusively through the message
//! channel ([`HostMessage`] in, [`WorkerMessage`] out); values are
//! marshalled by copy. User code cannot reach host memory, network
//! primitives are whatever the policy preamble installs, and no filesystem
//! access is exposed.
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod engine;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use capsule_js_common::message::{HostMessage, WorkerMessage};
use tokio::sync::mpsc::UnboundedReceiver;

/// A handle to one spawned interpreter worker.
///
/// Dropping the handle terminates the worker: the interrupt flag stops any
/// straight-line JS through the engine's interrupt handler, and the closed
/// command channel unblocks the message pump. Pending adapter calls are
/// abandoned, never resolved.
pub struct Worker {
    commands: mpsc::Sender<HostMessage>,
    events: Option<UnboundedReceiver<WorkerMessage>>,
    interrupt: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker thread with a fresh execution context.
    ///
    /// The context is not usable until the host sends
    /// [`HostMessage::Init`] and receives [`WorkerMessage::Ready`] back.
    pub fn spawn() -> std::io::Result<Self> {
        let (command_tx, command_rx) = mpsc::channel();
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let interrupt = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("capsule-worker".to_string())
            .spawn({
                let interrupt = Arc::clone(&interrupt);
                move || engine::run(command_rx, event_tx, interrupt)
            })?;
        Ok(Self {
            commands: command_tx,
            events: Some(event_rx),
            interrupt,
            thread: Some(thread),
        })
    }

    /// Send a message to the worker. Returns `false` when the worker has
    /// already terminated.
    pub fn send(&self, message: HostMessage) -> bool {
        self.commands.send(message).is_ok()
    }

    /// A clonable sender for the command channel, used by reply tasks that
    /// outlive a single borrow of the worker. Sends to a terminated worker
    /// fail and are discarded by the caller.
    pub fn command_sender(&self) -> mpsc::Sender<HostMessage> {
        self.commands.clone()
    }

    /// Take the event receiver. Yields `None` after the first call.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<WorkerMessage>> {
        self.events.take()
    }

    /// Request termination: any JS currently executing is interrupted at the
    /// next engine checkpoint.
    pub fn terminate(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.interrupt.store(true, Ordering::Relaxed);
        // The command sender drops with self, which unblocks the pump; the
        // thread then exits on its own.
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_js_common::message::WorkerInit;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn basic_init() -> WorkerInit {
        WorkerInit {
            preamble: String::new(),
            adapters: BTreeMap::new(),
            globals: BTreeMap::new(),
            env: BTreeMap::new(),
            allow_async: true,
            memory_limit_bytes: Some(64 * 1024 * 1024),
            max_log_lines: 20,
        }
    }

    async fn next_event(events: &mut UnboundedReceiver<WorkerMessage>) -> WorkerMessage {
        timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("worker timed out")
            .expect("worker hung up")
    }

    async fn run_snippet(init: WorkerInit, code: &str) -> (Worker, capsule_js_common::RunOutcome) {
        let mut worker = Worker::spawn().unwrap();
        let mut events = worker.take_events().unwrap();
        assert!(worker.send(HostMessage::Init(init)));
        assert!(matches!(next_event(&mut events).await, WorkerMessage::Ready));
        assert!(worker.send(HostMessage::Execute { code: code.to_string() }));
        loop {
            match next_event(&mut events).await {
                WorkerMessage::Result(outcome) => return (worker, outcome),
                WorkerMessage::Fatal { message } => panic!("worker failed: {message}"),
                WorkerMessage::AdapterCall { .. } => panic!("unexpected adapter call"),
                WorkerMessage::Ready => {}
            }
        }
    }

    #[tokio::test]
    async fn executes_a_simple_expression() {
        let (_worker, outcome) = run_snippet(basic_init(), "return 40 + 2;").await;
        assert!(outcome.success);
        assert_eq!(outcome.value, Some(json!(42)));
        assert!(outcome.logs.is_empty());
    }

    #[tokio::test]
    async fn undefined_result_is_absent() {
        let (_worker, outcome) = run_snippet(basic_init(), "const x = 1;").await;
        assert!(outcome.success);
        assert_eq!(outcome.value, None);
    }

    #[tokio::test]
    async fn collects_console_output_with_severity_prefixes() {
        let (_worker, outcome) = run_snippet(
            basic_init(),
            "console.log('hello', { a: 1 });\nconsole.error('bad');\nreturn 1;",
        )
        .await;
        assert_eq!(outcome.logs[0], "[log] hello {\"a\":1}");
        assert_eq!(outcome.logs[1], "[error] bad");
    }

    #[tokio::test]
    async fn console_stringifier_handles_cycles_and_bigints() {
        let (_worker, outcome) = run_snippet(
            basic_init(),
            "const o = { n: 10n }; o.me = o; console.log(o, 3n);\nreturn null;",
        )
        .await;
        assert!(outcome.logs[0].contains("[Circular]"));
        assert!(outcome.logs[0].contains("10n"));
        assert!(outcome.logs[0].ends_with(" 3n"));
    }

    #[tokio::test]
    async fn log_lines_are_capped() {
        let (_worker, outcome) = run_snippet(
            basic_init(),
            "for (let i = 0; i < 40; i++) { console.log('line', i); }\nreturn 0;",
        )
        .await;
        assert_eq!(outcome.logs.len(), 21);
        assert_eq!(outcome.logs[20], "[warn] log output truncated");
    }

    #[tokio::test]
    async fn user_throw_becomes_a_structured_error() {
        let (_worker, outcome) =
            run_snippet(basic_init(), "throw new TypeError('boom');").await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert_eq!(error.name, "TypeError");
        assert_eq!(error.message, "boom");
        assert!(error.stack.len() <= capsule_js_common::MAX_STACK_FRAMES);
    }

    #[tokio::test]
    async fn helpers_are_available() {
        let (_worker, outcome) = run_snippet(
            basic_init(),
            r#"
            const rows = [
              { user: { name: 'ada' }, n: 1 },
              { user: { name: 'brian' }, n: 2 },
              { user: { name: 'grace' }, n: 4 },
            ];
            return {
              picked: pick(rows, ['user.name']),
              firstTwo: first(rows, 2).length,
              total: sum(rows, 'n'),
              counted: count(rows, 'user.name'),
              rendered: table(rows, 2).length > 0,
            };
            "#,
        )
        .await;
        assert!(outcome.success, "{:?}", outcome.error);
        let value = outcome.value.unwrap();
        assert_eq!(value["picked"][0]["user.name"], "ada");
        assert_eq!(value["firstTwo"], 2);
        assert_eq!(value["total"], 7);
        assert_eq!(value["counted"], 3);
        assert_eq!(value["rendered"], true);
    }

    #[tokio::test]
    async fn injected_globals_and_env_are_visible() {
        let mut init = basic_init();
        init.globals.insert("limit".to_string(), json!(7));
        init.env.insert("REGION".to_string(), "eu-west-1".to_string());
        let (_worker, outcome) =
            run_snippet(init, "return { limit, region: env.REGION };").await;
        let value = outcome.value.unwrap();
        assert_eq!(value["limit"], 7);
        assert_eq!(value["region"], "eu-west-1");
    }

    #[tokio::test]
    async fn env_is_read_only() {
        let mut init = basic_init();
        init.env.insert("KEY".to_string(), "v1".to_string());
        let (_worker, outcome) = run_snippet(
            init,
            "try { env.KEY = 'v2'; } catch (e) {}\ntry { globalThis.env = {}; } catch (e) {}\nreturn env.KEY;",
        )
        .await;
        assert_eq!(outcome.value, Some(json!("v1")));
    }

    #[tokio::test]
    async fn adapter_calls_round_trip_with_out_of_order_replies() {
        let mut init = basic_init();
        init.adapters
            .insert("api".to_string(), vec!["get".to_string()]);

        let mut worker = Worker::spawn().unwrap();
        let mut events = worker.take_events().unwrap();
        assert!(worker.send(HostMessage::Init(init)));
        assert!(matches!(next_event(&mut events).await, WorkerMessage::Ready));
        assert!(worker.send(HostMessage::Execute {
            code: "const [a, b] = await Promise.all([adapters.api.get(1), adapters.api.get(2)]);\nreturn [a.v, b.v];".to_string(),
        }));

        let mut calls: Vec<(u64, Value)> = Vec::new();
        let outcome = loop {
            match next_event(&mut events).await {
                WorkerMessage::AdapterCall {
                    id,
                    adapter,
                    method,
                    args,
                } => {
                    assert_eq!(adapter, "api");
                    assert_eq!(method, "get");
                    calls.push((id, args[0].clone()));
                    if calls.len() == 2 {
                        // Reply in reverse order; resolution must follow ids.
                        for (id, arg) in calls.iter().rev() {
                            assert!(worker.send(HostMessage::AdapterResult {
                                id: *id,
                                result: Some(json!({ "v": arg })),
                                error: None,
                            }));
                        }
                    }
                }
                WorkerMessage::Result(outcome) => break outcome,
                WorkerMessage::Fatal { message } => panic!("worker failed: {message}"),
                WorkerMessage::Ready => {}
            }
        };

        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].0, calls[1].0, "call ids must be distinct");
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.value, Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn adapter_errors_reject_the_pending_call() {
        let mut init = basic_init();
        init.adapters
            .insert("api".to_string(), vec!["get".to_string()]);

        let mut worker = Worker::spawn().unwrap();
        let mut events = worker.take_events().unwrap();
        assert!(worker.send(HostMessage::Init(init)));
        assert!(matches!(next_event(&mut events).await, WorkerMessage::Ready));
        assert!(worker.send(HostMessage::Execute {
            code: "try { await adapters.api.get(1); return 'no'; } catch (e) { return e.message; }"
                .to_string(),
        }));

        let outcome = loop {
            match next_event(&mut events).await {
                WorkerMessage::AdapterCall { id, .. } => {
                    assert!(worker.send(HostMessage::AdapterResult {
                        id,
                        result: None,
                        error: Some("method not found".to_string()),
                    }));
                }
                WorkerMessage::Result(outcome) => break outcome,
                WorkerMessage::Fatal { message } => panic!("worker failed: {message}"),
                WorkerMessage::Ready => {}
            }
        };
        assert_eq!(outcome.value, Some(json!("method not found")));
    }

    #[tokio::test]
    async fn replies_to_unknown_ids_are_ignored() {
        let mut init = basic_init();
        init.adapters
            .insert("api".to_string(), vec!["get".to_string()]);

        let mut worker = Worker::spawn().unwrap();
        let mut events = worker.take_events().unwrap();
        assert!(worker.send(HostMessage::Init(init)));
        assert!(matches!(next_event(&mut events).await, WorkerMessage::Ready));
        assert!(worker.send(HostMessage::Execute {
            code: "const v = await adapters.api.get(1);\nreturn v;".to_string(),
        }));

        let outcome = loop {
            match next_event(&mut events).await {
                WorkerMessage::AdapterCall { id, .. } => {
                    // A bogus id first; the worker must not resolve on it.
                    assert!(worker.send(HostMessage::AdapterResult {
                        id: id + 1000,
                        result: Some(json!("wrong")),
                        error: None,
                    }));
                    assert!(worker.send(HostMessage::AdapterResult {
                        id,
                        result: Some(json!("right")),
                        error: None,
                    }));
                }
                WorkerMessage::Result(outcome) => break outcome,
                WorkerMessage::Fatal { message } => panic!("worker failed: {message}"),
                WorkerMessage::Ready => {}
            }
        };
        assert_eq!(outcome.value, Some(json!("right")));
    }

    #[tokio::test]
    async fn termination_interrupts_a_busy_loop() {
        let mut worker = Worker::spawn().unwrap();
        let mut events = worker.take_events().unwrap();
        assert!(worker.send(HostMessage::Init(basic_init())));
        assert!(matches!(next_event(&mut events).await, WorkerMessage::Ready));
        assert!(worker.send(HostMessage::Execute {
            code: "for (let i = 0;; i++) { if (i < 0) break; }".to_string(),
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.terminate();

        // The thread must wind down; no result event is required.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !worker.is_finished() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(worker.is_finished(), "worker thread did not stop");
    }

    #[tokio::test]
    async fn sync_mode_rejects_await_at_parse_time() {
        let mut init = basic_init();
        init.allow_async = false;
        let (_worker, outcome) =
            run_snippet(init, "return await Promise.resolve(1);").await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().name, "SyntaxError");
    }
}
