//! Named tasks: host-registered, parameterized routines exposed through the
//! `run-named-task` surface.
//!
//! A task runs host-side (it is trusted code), with a context that exposes
//! its inputs and the adapter catalog by name. Each run races an independent
//! timer with the same semantics as sandbox timeouts.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::warn;

use crate::adapter::{AdapterRegistry, DispatchError, MethodFuture, ParameterType};

/// Schema of one task input.
#[derive(Debug, Clone)]
pub struct SkillInput {
    /// Semantic type tag.
    pub input_type: ParameterType,
    /// Human description.
    pub description: Option<String>,
    /// Default value, merged into the inputs record when the caller omits
    /// the key.
    pub default: Option<Value>,
}

impl SkillInput {
    /// An input of the given type.
    pub fn new(input_type: ParameterType) -> Self {
        Self {
            input_type,
            description: None,
            default: None,
        }
    }

    /// Attach a description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a default.
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// What a running task can reach: its inputs and the adapters.
pub struct SkillContext {
    /// The merged inputs record.
    pub inputs: Value,
    adapters: Arc<AdapterRegistry>,
}

impl SkillContext {
    /// One named input, if present.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Invoke an adapter method by name.
    pub async fn call_adapter(
        &self,
        adapter: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, DispatchError> {
        self.adapters.dispatch(adapter, method, args).await
    }
}

type Runner = Arc<dyn Fn(SkillContext) -> MethodFuture + Send + Sync>;

/// A host-registered named task.
#[derive(Clone)]
pub struct Skill {
    /// Task name; the `run-named-task` key.
    pub name: String,
    /// Human description, surfaced by list/search.
    pub description: Option<String>,
    /// Input schema, keyed by input name.
    pub inputs: BTreeMap<String, SkillInput>,
    /// Per-task timeout override; the sandbox default applies otherwise.
    pub timeout_ms: Option<u64>,
    runner: Runner,
}

impl Skill {
    /// Create a task with a runner that rejects until one is set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: BTreeMap::new(),
            timeout_ms: None,
            runner: Arc::new(|_| Box::pin(async { Err("task has no runner".to_string()) })),
        }
    }

    /// Attach a description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare an input.
    pub fn input(mut self, name: impl Into<String>, input: SkillInput) -> Self {
        self.inputs.insert(name.into(), input);
        self
    }

    /// Override the timeout for this task.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the runner.
    pub fn runner<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SkillContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.runner = Arc::new(move |cx| Box::pin(f(cx)));
        self
    }

    /// Merge declared defaults into a caller-provided inputs record.
    pub fn merged_inputs(&self, provided: Option<Value>) -> Value {
        let mut record = match provided {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (name, input) in &self.inputs {
            if let Some(default) = &input.default {
                record.entry(name.clone()).or_insert_with(|| default.clone());
            }
        }
        Value::Object(record)
    }

    /// Run the task against the given adapters.
    pub fn run(&self, inputs: Value, adapters: Arc<AdapterRegistry>) -> MethodFuture {
        (self.runner)(SkillContext { inputs, adapters })
    }
}

impl fmt::Debug for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skill")
            .field("name", &self.name)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Process-wide named-task registry.
#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<BTreeMap<String, Arc<Skill>>>,
}

impl SkillRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task; overwriting logs a warning.
    pub fn register(&self, skill: Skill) {
        let mut skills = self.write_lock();
        if skills.contains_key(&skill.name) {
            warn!(task = %skill.name, "overwriting existing named task");
        }
        skills.insert(skill.name.clone(), Arc::new(skill));
    }

    /// Look up a task by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Skill>> {
        self.read_lock().get(name).cloned()
    }

    /// Snapshot of every task, in name order.
    pub fn enumerate(&self) -> Vec<Arc<Skill>> {
        self.read_lock().values().cloned().collect()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Skill>>> {
        match self.skills.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Skill>>> {
        match self.skills.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for SkillRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkillRegistry")
            .field("skills", &self.read_lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, MethodDescriptor};
    use serde_json::json;

    #[tokio::test]
    async fn runs_with_merged_defaults_and_adapter_access() {
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(Adapter::new("api").method(
            MethodDescriptor::new("double", "Double a number").handler(|args| async move {
                let n = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                Ok(json!(n * 2.0))
            }),
        ));

        let skill = Skill::new("double-limit")
            .describe("Double the configured limit")
            .input(
                "limit",
                SkillInput::new(ParameterType::Number).default_value(json!(21)),
            )
            .runner(|cx| async move {
                let limit = cx.input("limit").cloned().unwrap_or(Value::Null);
                cx.call_adapter("api", "double", vec![limit])
                    .await
                    .map_err(|e| e.to_string())
            });

        let inputs = skill.merged_inputs(None);
        let result = skill.run(inputs, adapters).await.unwrap();
        assert_eq!(result, json!(42.0));
    }

    #[test]
    fn provided_inputs_win_over_defaults() {
        let skill = Skill::new("t").input(
            "limit",
            SkillInput::new(ParameterType::Number).default_value(json!(5)),
        );
        let merged = skill.merged_inputs(Some(json!({ "limit": 9 })));
        assert_eq!(merged, json!({ "limit": 9 }));

        let merged = skill.merged_inputs(Some(json!({})));
        assert_eq!(merged, json!({ "limit": 5 }));
    }

    #[test]
    fn registry_lookup_and_enumerate() {
        let registry = SkillRegistry::new();
        registry.register(Skill::new("a"));
        registry.register(Skill::new("b"));
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup("a").is_some());
        assert!(registry.lookup("missing").is_none());
        let names: Vec<String> = registry.enumerate().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
