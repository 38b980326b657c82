//! End-to-end runs through the orchestrator: normalize, analyze, worker,
//! bridge, summarize.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use capsule_js::fetch::{FetchFuture, FetchRequest, FetchResponse, OutboundHttp};
use capsule_js::{
    run_named_task, Adapter, AdapterRegistry, Limits, MethodDescriptor, NetworkPolicy, Sandbox,
    SandboxSettings, Severity, Skill,
};
use serde_json::{json, Value};

fn stub_registry(calls: Arc<Mutex<Vec<Vec<Value>>>>) -> Arc<AdapterRegistry> {
    let registry = AdapterRegistry::new();
    registry.register(
        Adapter::new("api")
            .describe("Test adapter")
            .method(
                MethodDescriptor::new("getData", "Return a fixed record").handler({
                    let calls = Arc::clone(&calls);
                    move |args| {
                        calls.lock().unwrap().push(args);
                        async move { Ok(json!({ "id": 1 })) }
                    }
                }),
            )
            .method(MethodDescriptor::new("get", "Echo the first argument").handler({
                let calls = Arc::clone(&calls);
                move |args| {
                    calls.lock().unwrap().push(args.clone());
                    async move { Ok(args.first().cloned().unwrap_or(Value::Null)) }
                }
            })),
    );
    Arc::new(registry)
}

fn sandbox_with(settings: SandboxSettings, calls: Arc<Mutex<Vec<Vec<Value>>>>) -> Sandbox {
    Sandbox::new(settings, stub_registry(calls))
}

#[tokio::test]
async fn expression_auto_return_round_trips_through_an_adapter() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(SandboxSettings::default(), Arc::clone(&calls));

    let result = sandbox.execute("adapters.api.getData()").await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!({ "id": 1 })));
    assert!(result.logs.is_empty(), "{:?}", result.logs);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn infinite_loop_is_rejected_before_any_worker_runs() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(SandboxSettings::default(), Arc::clone(&calls));

    let started = Instant::now();
    let result = sandbox.execute("while(true) { console.log('x'); }").await;
    assert!(!result.success);
    assert_eq!(result.error_name(), Some("AnalysisError"));
    let error = result.error.unwrap();
    assert!(error.message.contains("no-infinite-loop"), "{}", error.message);
    // Rejection happens in analysis, far inside the 5 s execution budget.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn adapter_in_loop_warns_and_still_executes() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(SandboxSettings::default(), Arc::clone(&calls));

    let result = sandbox
        .execute("for (const id of [1, 2]) { await adapters.api.get(id); }")
        .await;
    assert!(result.success, "{:?}", result.error);
    assert!(
        result
            .logs
            .iter()
            .any(|line| line.contains("no-adapter-in-loop")),
        "{:?}",
        result.logs
    );
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], vec![json!(1)]);
    assert_eq!(calls[1], vec![json!(2)]);
}

#[tokio::test]
async fn blocked_policy_rejects_fetch() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(SandboxSettings::default(), calls);

    let result = sandbox.execute("return fetch('https://x')").await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(
        error.message.contains("Network access is blocked"),
        "unexpected message: {}",
        error.message
    );
}

struct StubHttp {
    requests: Mutex<Vec<FetchRequest>>,
}

impl StubHttp {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
        })
    }
}

impl OutboundHttp for StubHttp {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        self.requests.lock().unwrap().push(request);
        Box::pin(async {
            Ok(FetchResponse {
                ok: true,
                status: 200,
                status_text: "OK".to_string(),
                headers: BTreeMap::new(),
                body: "{\"fine\":true}".to_string(),
                url: "https://api.example.com/a".to_string(),
            })
        })
    }
}

#[tokio::test]
async fn allow_list_permits_listed_domains_and_blocks_the_rest() {
    let http = StubHttp::new();
    let settings = SandboxSettings {
        network_policy: NetworkPolicy::allow_list(["example.com"]),
        ..SandboxSettings::default()
    };
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox =
        sandbox_with(settings, calls).with_outbound_http(Arc::clone(&http) as Arc<dyn OutboundHttp>);

    let result = sandbox
        .execute("return (await fetch('https://api.example.com/a')).ok")
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!(true)));
    assert_eq!(http.requests.lock().unwrap().len(), 1);

    let result = sandbox
        .execute("return (await fetch('https://evil.com/a')).ok")
        .await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(
        error.message.contains("Network access blocked"),
        "unexpected message: {}",
        error.message
    );
    // The rejected fetch never reached the HTTP capability.
    assert_eq!(http.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn timeout_terminates_a_runaway_loop() {
    let mut settings = SandboxSettings {
        timeout_ms: 200,
        ..SandboxSettings::default()
    };
    // The loop below trips no-infinite-loop; turning the rule off forces
    // the timer to do the work.
    settings
        .analysis
        .rules
        .insert("no-infinite-loop".to_string(), Severity::Off);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(settings, calls);

    let started = Instant::now();
    let result = sandbox
        .execute("for (let i = 0;; i++) { if (i < 0) break; }")
        .await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert_eq!(result.error_name(), Some("TimeoutError"));
    assert!(elapsed >= Duration::from_millis(200), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "fired late: {elapsed:?}");
}

#[tokio::test]
async fn empty_snippet_succeeds_with_no_value_and_no_logs() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(SandboxSettings::default(), calls);

    let result = sandbox.execute("   ").await;
    assert!(result.success);
    assert_eq!(result.value, None);
    assert!(result.logs.is_empty());
}

#[tokio::test]
async fn lone_function_declaration_returns_undefined() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(SandboxSettings::default(), calls);

    let result = sandbox
        .execute("function handler(x) { return x * 2; }")
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, None);
}

#[tokio::test]
async fn unknown_adapter_method_rejects_inside_the_sandbox() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(SandboxSettings::default(), calls);

    let result = sandbox
        .execute(
            "try { await adapters.api.missing(); return 'no'; } catch (e) { return e.message; }",
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    let message = result.value.unwrap();
    assert!(
        message.as_str().unwrap().contains("method not found"),
        "{message}"
    );
}

#[tokio::test]
async fn analysis_errors_surface_in_logs_when_not_blocking() {
    let mut settings = SandboxSettings::default();
    settings.analysis.block_on_error = false;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(settings, calls);

    let result = sandbox
        .execute("while (true) { if (done()) break; }\neval('1')\nreturn 1")
        .await;
    // eval is rejected at runtime too (the analyzer finding must still be
    // visible in the logs even though the run was allowed to proceed).
    assert!(
        result
            .logs
            .iter()
            .any(|line| line.contains("no-dangerous-globals")),
        "{:?}",
        result.logs
    );
}

#[tokio::test]
async fn execute_summarizes_large_values() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = sandbox_with(SandboxSettings::default(), calls);

    let result = sandbox
        .execute_with(
            "return Array.from({ length: 30 }, (_, i) => i)",
            Limits {
                max_items: 10,
                max_string_length: 500,
            },
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.truncated);
    let items = result.value.unwrap();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 11);
    assert_eq!(items[10], json!("... (20 more items)"));
}

#[tokio::test]
async fn concurrent_runs_do_not_share_state() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sandbox = Arc::new(sandbox_with(SandboxSettings::default(), calls));

    let a = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.execute("globalThis.counter = 1; return counter;").await })
    };
    let b = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(
            async move { sandbox.execute("return typeof globalThis.counter;").await },
        )
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(a.value, Some(json!(1)));
    // A fresh context never sees the other run's globals.
    assert_eq!(b.value, Some(json!("undefined")));
}

#[tokio::test]
async fn named_tasks_run_with_inputs_and_their_own_timeout() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let adapters = stub_registry(calls);

    let skill = Skill::new("echo")
        .describe("Echo the given value")
        .runner(|cx| async move { Ok(cx.input("value").cloned().unwrap_or(Value::Null)) });
    let result = run_named_task(
        &skill,
        Some(json!({ "value": { "hello": "world" } })),
        Arc::clone(&adapters),
        5000,
        Limits::default(),
    )
    .await;
    assert!(result.success);
    assert_eq!(result.value, Some(json!({ "hello": "world" })));

    let slow = Skill::new("slow").timeout_ms(100).runner(|_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });
    let started = Instant::now();
    let result = run_named_task(&slow, None, adapters, 5000, Limits::default()).await;
    assert!(!result.success);
    assert_eq!(result.error_name(), Some("TimeoutError"));
    assert!(started.elapsed() < Duration::from_secs(2));
}
