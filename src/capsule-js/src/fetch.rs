//! Host-mediated outbound HTTP for sandboxed `fetch`.
//!
//! The worker never talks to the network itself: the policy preamble's
//! `fetch` wrapper routes through the bridge as a reserved `__net` call, the
//! orchestrator validates the URL against the policy, and an
//! [`OutboundHttp`] implementation performs the request. Tests substitute a
//! stub implementation.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fetch attempted by sandboxed code, already coerced to a URL string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Absolute URL.
    pub url: String,
    /// HTTP method; defaults to GET.
    pub method: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Request body, if any.
    pub body: Option<String>,
}

impl FetchRequest {
    /// Decode the `[url, init]` argument pair the sandbox wrapper emits.
    pub fn from_bridge_args(args: &[Value]) -> Result<Self, String> {
        let url = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| "fetch: missing URL".to_string())?
            .to_string();
        let options = args.get(1);
        let method = options
            .and_then(|o| o.get("method"))
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let mut headers = BTreeMap::new();
        if let Some(Value::Object(map)) = options.and_then(|o| o.get("headers")) {
            for (name, value) in map {
                if let Some(value) = value.as_str() {
                    headers.insert(name.clone(), value.to_string());
                }
            }
        }
        let body = options.and_then(|o| o.get("body")).and_then(|b| match b {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        });
        Ok(Self {
            url,
            method,
            headers,
            body,
        })
    }
}

/// What comes back to the sandbox; the worker's response shim wraps it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    /// Whether the status code was in the 2xx range.
    pub ok: bool,
    /// HTTP status code.
    pub status: u16,
    /// Canonical status reason.
    pub status_text: String,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Response body as text.
    pub body: String,
    /// Final URL after redirects.
    pub url: String,
}

/// Future returned by [`OutboundHttp::fetch`].
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchResponse, String>> + Send>>;

/// The outbound HTTP capability behind sandbox `fetch`.
pub trait OutboundHttp: Send + Sync {
    /// Perform one request. Policy validation has already happened.
    fn fetch(&self, request: FetchRequest) -> FetchFuture;
}

/// Production implementation backed by a shared reqwest client.
#[derive(Debug, Default, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Build a client with reqwest defaults.
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutboundHttp for HttpClient {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let client = self.client.clone();
        Box::pin(async move {
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|_| format!("fetch: invalid method {:?}", request.method))?;
            let mut builder = client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            let response = builder
                .send()
                .await
                .map_err(|e| format!("fetch failed: {e}"))?;

            let status = response.status();
            let url = response.url().to_string();
            let mut headers = BTreeMap::new();
            for (name, value) in response.headers() {
                if let Ok(value) = value.to_str() {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
            let body = response
                .text()
                .await
                .map_err(|e| format!("fetch: reading body failed: {e}"))?;
            Ok(FetchResponse {
                ok: status.is_success(),
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                headers,
                body,
                url,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_url_and_options() {
        let args = vec![
            json!("https://api.example.com/items"),
            json!({
                "method": "post",
                "headers": { "content-type": "application/json" },
                "body": "{\"a\":1}"
            }),
        ];
        let request = FetchRequest::from_bridge_args(&args).unwrap();
        assert_eq!(request.url, "https://api.example.com/items");
        assert_eq!(request.method, "POST");
        assert_eq!(request.headers["content-type"], "application/json");
        assert_eq!(request.body.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn defaults_to_get_with_no_options() {
        let request =
            FetchRequest::from_bridge_args(&[json!("https://example.com/")]).unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.headers.is_empty());
        assert!(request.body.is_none());
    }

    #[test]
    fn missing_url_is_an_error() {
        assert!(FetchRequest::from_bridge_args(&[]).is_err());
        assert!(FetchRequest::from_bridge_args(&[json!(42)]).is_err());
    }

    #[test]
    fn response_serializes_camel_case_for_the_shim() {
        let response = FetchResponse {
            ok: true,
            status: 200,
            status_text: "OK".to_string(),
            headers: BTreeMap::new(),
            body: "{}".to_string(),
            url: "https://example.com/".to_string(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["statusText"], "OK");
        assert_eq!(value["ok"], true);
    }
}
