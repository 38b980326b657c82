//! Sandbox configuration records.
//!
//! These are loaded once at server start from a host-controlled source and
//! threaded explicitly through the orchestrator; there is no ambient
//! per-request state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Governs which outbound endpoints sandboxed code may contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// Every network primitive throws. The default.
    #[default]
    Blocked,
    /// `fetch` is permitted for the listed domains and their subdomains;
    /// every other primitive stays blocked.
    AllowList(Vec<String>),
    /// No restriction.
    Unrestricted,
}

impl NetworkPolicy {
    /// Convenience constructor for the allow-list variant.
    pub fn allow_list<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NetworkPolicy::AllowList(domains.into_iter().map(Into::into).collect())
    }
}

/// Severity of a rule, or `Off` to remove it from the visitor map.
///
/// Built-in defaults only use `Warn` and `Error`; `Off` exists for
/// per-config overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational finding; never gates execution.
    Warn,
    /// Gating finding under `block_on_error`.
    Error,
    /// Rule disabled.
    Off,
}

/// Static-analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Whether the analyzer runs at all.
    pub enabled: bool,
    /// When true, any error-severity finding rejects the run.
    pub block_on_error: bool,
    /// Per-rule severity overrides, keyed by rule name.
    pub rules: BTreeMap<String, Severity>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            block_on_error: true,
            rules: BTreeMap::new(),
        }
    }
}

/// Per-process sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Wall-clock budget for one run.
    pub timeout_ms: u64,
    /// Interpreter heap hint, in mebibytes.
    pub memory_hint_mb: Option<u64>,
    /// Whether snippets may use `await` (compiled as an async body).
    pub allow_async: bool,
    /// Host-injected globals, installed verbatim in the sandbox.
    pub globals: BTreeMap<String, Value>,
    /// Outbound network policy.
    pub network_policy: NetworkPolicy,
    /// Whether bare expression snippets are rewritten to `return` their value.
    pub normalize: bool,
    /// Static-analysis configuration.
    pub analysis: AnalysisSettings,
}

impl SandboxSettings {
    /// Default wall-clock budget.
    pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
    /// Default interpreter heap hint.
    pub const DEFAULT_MEMORY_HINT_MB: u64 = 128;
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            memory_hint_mb: Some(Self::DEFAULT_MEMORY_HINT_MB),
            allow_async: true,
            globals: BTreeMap::new(),
            network_policy: NetworkPolicy::default(),
            normalize: true,
            analysis: AnalysisSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let settings = SandboxSettings::default();
        assert_eq!(settings.timeout_ms, 5_000);
        assert_eq!(settings.network_policy, NetworkPolicy::Blocked);
        assert!(settings.normalize);
        assert!(settings.analysis.enabled);
        assert!(settings.analysis.block_on_error);
    }

    #[test]
    fn policy_deserializes_from_config_json() {
        let policy: NetworkPolicy =
            serde_json::from_str(r#"{"allow_list":["example.com"]}"#).unwrap();
        assert_eq!(policy, NetworkPolicy::allow_list(["example.com"]));

        let policy: NetworkPolicy = serde_json::from_str(r#""blocked""#).unwrap();
        assert_eq!(policy, NetworkPolicy::Blocked);
    }

    #[test]
    fn severity_override_parses_lowercase() {
        let rules: BTreeMap<String, Severity> =
            serde_json::from_str(r#"{"no-infinite-loop":"off","no-nested-loops":"error"}"#)
                .unwrap();
        assert_eq!(rules["no-infinite-loop"], Severity::Off);
        assert_eq!(rules["no-nested-loops"], Severity::Error);
    }
}
