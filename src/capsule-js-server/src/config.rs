//! Server configuration, loaded once at startup from a host-controlled JSON
//! file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use capsule_js::http_adapter::HttpAdapterSpec;
use capsule_js::SandboxSettings;
use serde::{Deserialize, Serialize};

/// The process-wide configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Sandbox settings applied to every run.
    pub sandbox: SandboxSettings,
    /// Declarative HTTP adapters registered at startup.
    pub adapters: Vec<HttpAdapterSpec>,
    /// Literal environment entries exposed to the sandbox.
    pub env: BTreeMap<String, String>,
    /// Names copied from the process environment into the sandbox view.
    /// Everything else in the process environment stays invisible.
    pub env_passthrough: Vec<String>,
    /// Listen address for the HTTP transport, e.g. `127.0.0.1:8976`.
    pub http_addr: Option<String>,
    /// Serve line-delimited JSON-RPC on stdio.
    pub stdio: bool,
}

impl ServerConfig {
    /// Load and parse the configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing configuration from {}", path.display()))
    }

    /// The filtered, read-only environment record the sandbox sees:
    /// literal entries plus the explicit pass-through names.
    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        for name in &self.env_passthrough {
            if let Ok(value) = std::env::var(name) {
                env.entry(name.clone()).or_insert(value);
            }
        }
        env
    }
}
