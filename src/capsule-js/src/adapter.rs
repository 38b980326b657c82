//! The adapter registry: named adapters with typed method descriptors.
//!
//! Adapters are host-side capabilities (usually HTTP-backed) exposed to
//! sandboxed code through bridge proxies. The registry publishes schemas for
//! LLM consumption but does not validate arguments at call time; that is the
//! adapter's own responsibility.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use capsule_js_common::message::AdapterCatalog;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Future returned by adapter method handlers.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

type Handler = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;
type DisposeHook = Box<dyn Fn() + Send + Sync>;

/// The closed set of parameter type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// A string value.
    String,
    /// A numeric value.
    Number,
    /// A boolean value.
    Boolean,
    /// A record value.
    Object,
    /// An array value.
    Array,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object => "object",
            ParameterType::Array => "array",
        };
        f.write_str(tag)
    }
}

/// Schema of a single method parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Semantic type tag.
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    /// Whether the parameter must be supplied.
    #[serde(default)]
    pub required: bool,
    /// Human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Published default. Not applied by the engine at call time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterSpec {
    /// A required parameter of the given type.
    pub fn required(param_type: ParameterType) -> Self {
        Self {
            param_type,
            required: true,
            description: None,
            default: None,
        }
    }

    /// An optional parameter of the given type.
    pub fn optional(param_type: ParameterType) -> Self {
        Self {
            param_type,
            required: false,
            description: None,
            default: None,
        }
    }

    /// Attach a description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A named, typed, callable adapter method.
#[derive(Clone)]
pub struct MethodDescriptor {
    /// Method name.
    pub name: String,
    /// Human description, surfaced by list/search.
    pub description: String,
    /// Parameter schema, keyed by parameter name.
    pub parameters: BTreeMap<String, ParameterSpec>,
    handler: Handler,
}

impl MethodDescriptor {
    /// Create a descriptor with a handler that rejects until one is set.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
            handler: Arc::new(|_| {
                Box::pin(async { Err("method has no handler".to_string()) })
            }),
        }
    }

    /// Add a parameter to the schema.
    pub fn parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    /// Set the handler. Arguments arrive as the positional array the sandbox
    /// proxy collected; the result is marshalled back by value.
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.handler = Arc::new(move |args| Box::pin(f(args)));
        self
    }

    /// Invoke the handler.
    pub fn invoke(&self, args: Vec<Value>) -> MethodFuture {
        (self.handler)(args)
    }

    /// TypeScript-like signature for presentation:
    /// `getData(id: number, verbose?: boolean): Promise<any>`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|(name, spec)| {
                let optional = if spec.required { "" } else { "?" };
                format!("{name}{optional}: {}", spec.param_type)
            })
            .collect();
        format!("{}({}): Promise<any>", self.name, params.join(", "))
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// A named collection of callable methods.
pub struct Adapter {
    /// Adapter name; the first segment of `adapters.<name>.<method>`.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
    /// Version string, if the host publishes one.
    pub version: Option<String>,
    methods: BTreeMap<String, MethodDescriptor>,
    dispose: Option<DisposeHook>,
}

impl Adapter {
    /// Create an empty adapter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: None,
            methods: BTreeMap::new(),
            dispose: None,
        }
    }

    /// Attach a description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a version string.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Add a method.
    pub fn method(mut self, descriptor: MethodDescriptor) -> Self {
        self.methods.insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Install a dispose hook, run when the registry shuts down.
    pub fn on_dispose(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.dispose = Some(Box::new(hook));
        self
    }

    /// The methods of this adapter, in name order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }

    /// Look up one method.
    pub fn method_named(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Why a bridge dispatch failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No such adapter or method. The worker surfaces this as a rejected
    /// adapter call.
    #[error("method not found: {adapter}.{method}")]
    MethodNotFound {
        /// Requested adapter name.
        adapter: String,
        /// Requested method name.
        method: String,
    },
    /// The handler itself failed.
    #[error("{0}")]
    Failed(String),
}

/// Process-wide adapter registry. Read-mostly after startup; registration
/// during serving is permitted but the host must not race it with its own
/// shutdown.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<BTreeMap<String, Arc<Adapter>>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Idempotent; overwriting an existing name logs a
    /// warning and replaces it.
    pub fn register(&self, adapter: Adapter) {
        let mut adapters = self.write_lock();
        if adapters.contains_key(&adapter.name) {
            warn!(adapter = %adapter.name, "overwriting existing adapter registration");
        }
        adapters.insert(adapter.name.clone(), Arc::new(adapter));
    }

    /// Look up a method descriptor.
    pub fn lookup(&self, adapter: &str, method: &str) -> Option<MethodDescriptor> {
        self.read_lock()
            .get(adapter)
            .and_then(|a| a.method_named(method).cloned())
    }

    /// Snapshot of every adapter, in name order.
    pub fn enumerate(&self) -> Vec<Arc<Adapter>> {
        self.read_lock().values().cloned().collect()
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    /// The name → method-names catalog shipped to workers.
    pub fn catalog(&self) -> AdapterCatalog {
        self.read_lock()
            .iter()
            .map(|(name, adapter)| {
                (
                    name.clone(),
                    adapter.methods().map(|m| m.name.clone()).collect(),
                )
            })
            .collect()
    }

    /// Dispatch one bridge call.
    pub async fn dispatch(
        &self,
        adapter: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, DispatchError> {
        let Some(descriptor) = self.lookup(adapter, method) else {
            return Err(DispatchError::MethodNotFound {
                adapter: adapter.to_string(),
                method: method.to_string(),
            });
        };
        descriptor.invoke(args).await.map_err(DispatchError::Failed)
    }

    /// Run every dispose hook. Called once at server shutdown.
    pub fn dispose_all(&self) {
        for adapter in self.read_lock().values() {
            if let Some(hook) = &adapter.dispose {
                hook();
            }
        }
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Adapter>>> {
        match self.adapters.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Adapter>>> {
        match self.adapters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.read_lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_adapter() -> Adapter {
        Adapter::new("api")
            .describe("Sample HTTP API")
            .version("1.2.0")
            .method(
                MethodDescriptor::new("getData", "Fetch a record by id")
                    .parameter("id", ParameterSpec::required(ParameterType::Number))
                    .parameter(
                        "verbose",
                        ParameterSpec::optional(ParameterType::Boolean).describe("Include details"),
                    )
                    .handler(|args| async move {
                        Ok(json!({ "id": args.first().cloned().unwrap_or(Value::Null) }))
                    }),
            )
    }

    #[tokio::test]
    async fn dispatch_invokes_the_handler() {
        let registry = AdapterRegistry::new();
        registry.register(sample_adapter());
        let result = registry
            .dispatch("api", "getData", vec![json!(7)])
            .await
            .unwrap();
        assert_eq!(result, json!({ "id": 7 }));
    }

    #[tokio::test]
    async fn dispatch_reports_unknown_methods() {
        let registry = AdapterRegistry::new();
        registry.register(sample_adapter());
        let err = registry.dispatch("api", "nope", vec![]).await.unwrap_err();
        assert!(matches!(err, DispatchError::MethodNotFound { .. }));
        assert_eq!(err.to_string(), "method not found: api.nope");

        let err = registry.dispatch("ghost", "getData", vec![]).await.unwrap_err();
        assert!(matches!(err, DispatchError::MethodNotFound { .. }));
    }

    #[test]
    fn catalog_lists_names_only() {
        let registry = AdapterRegistry::new();
        registry.register(sample_adapter());
        let catalog = registry.catalog();
        assert_eq!(catalog["api"], vec!["getData".to_string()]);
    }

    #[test]
    fn signatures_render_typescript_style() {
        let adapter = sample_adapter();
        let descriptor = adapter.method_named("getData").unwrap();
        assert_eq!(
            descriptor.signature(),
            "getData(id: number, verbose?: boolean): Promise<any>"
        );
    }

    #[test]
    fn reregistration_replaces_the_adapter() {
        let registry = AdapterRegistry::new();
        registry.register(sample_adapter());
        registry.register(Adapter::new("api"));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("api", "getData").is_none());
    }

    #[test]
    fn dispose_hooks_run_once_per_adapter() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DISPOSED: AtomicUsize = AtomicUsize::new(0);

        let registry = AdapterRegistry::new();
        registry.register(
            Adapter::new("closable").on_dispose(|| {
                DISPOSED.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.dispose_all();
        assert_eq!(DISPOSED.load(Ordering::SeqCst), 1);
    }
}
