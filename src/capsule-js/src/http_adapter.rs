//! Declarative HTTP-backed adapters.
//!
//! The host configuration can describe an adapter as a base URL plus a set
//! of methods, each mapping to a request template. The sandbox calls the
//! method with a single params record; path placeholders are substituted
//! from it, the rest travels as query parameters (GET/DELETE) or as the
//! JSON body. Generated adapters are ordinary [`Adapter`]s: the engine
//! treats them no differently from programmatically registered ones.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::{Adapter, MethodDescriptor, ParameterSpec};
use crate::fetch::{FetchRequest, OutboundHttp};

/// Configuration of one HTTP-backed adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpAdapterSpec {
    /// Adapter name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Base URL every method path is joined to.
    pub base_url: String,
    /// Method templates, keyed by method name.
    pub methods: BTreeMap<String, HttpMethodSpec>,
}

/// Configuration of one method on an HTTP adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMethodSpec {
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// HTTP verb; defaults to GET.
    #[serde(default = "default_verb")]
    pub http_method: String,
    /// Path template, joined to the base URL. `{name}` placeholders are
    /// substituted from the params record.
    pub path: String,
    /// Published parameter schema.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

fn default_verb() -> String {
    "GET".to_string()
}

/// Build a registrable adapter from a spec, performing requests through the
/// given HTTP capability.
pub fn build(spec: &HttpAdapterSpec, http: Arc<dyn OutboundHttp>) -> Adapter {
    let mut adapter = Adapter::new(spec.name.clone());
    if let Some(description) = &spec.description {
        adapter = adapter.describe(description.clone());
    }
    if let Some(version) = &spec.version {
        adapter = adapter.version(version.clone());
    }
    for (method_name, method_spec) in &spec.methods {
        let mut descriptor =
            MethodDescriptor::new(method_name.clone(), method_spec.description.clone());
        for (param_name, param_spec) in &method_spec.parameters {
            descriptor = descriptor.parameter(param_name.clone(), param_spec.clone());
        }

        let http = Arc::clone(&http);
        let base_url = spec.base_url.trim_end_matches('/').to_string();
        let verb = method_spec.http_method.to_ascii_uppercase();
        let path = method_spec.path.clone();
        descriptor = descriptor.handler(move |args| {
            let http = Arc::clone(&http);
            let request = build_request(&base_url, &verb, &path, args.first());
            async move {
                let request = request?;
                let response = http.fetch(request).await?;
                if !response.ok {
                    return Err(format!(
                        "request failed with status {} {}",
                        response.status, response.status_text
                    ));
                }
                // JSON bodies come back structured; anything else as text.
                Ok(serde_json::from_str(&response.body)
                    .unwrap_or(Value::String(response.body)))
            }
        });
        adapter = adapter.method(descriptor);
    }
    adapter
}

/// Expand the template into a concrete request from the params record.
fn build_request(
    base_url: &str,
    verb: &str,
    path: &str,
    params: Option<&Value>,
) -> Result<FetchRequest, String> {
    let params = match params {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => serde_json::Map::new(),
        Some(other) => {
            return Err(format!(
                "expected a params record, got {}",
                value_kind(other)
            ))
        }
    };

    let mut remaining = params;
    let mut expanded = String::new();
    let mut rest = path;
    while let Some(open) = rest.find('{') {
        expanded.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            return Err(format!("unbalanced placeholder in path template {path:?}"));
        };
        let name = &rest[open + 1..open + close];
        let Some(value) = remaining.remove(name) else {
            return Err(format!("missing path parameter {name:?}"));
        };
        expanded.push_str(&scalar_text(&value));
        rest = &rest[open + close + 1..];
    }
    expanded.push_str(rest);

    let mut url = format!("{base_url}/{}", expanded.trim_start_matches('/'));
    let mut headers = BTreeMap::new();
    let mut body = None;

    if matches!(verb, "GET" | "DELETE" | "HEAD") {
        let query: Vec<String> = remaining
            .iter()
            .map(|(name, value)| format!("{}={}", urlencode(name), urlencode(&scalar_text(value))))
            .collect();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
    } else if !remaining.is_empty() {
        headers.insert("content-type".to_string(), "application/json".to_string());
        body = Some(Value::Object(remaining).to_string());
    }

    Ok(FetchRequest {
        url,
        method: verb.to_string(),
        headers,
        body,
    })
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn urlencode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
