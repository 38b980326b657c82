//! capsule-js executes small, untrusted JavaScript programs on behalf of a
//! large-language-model agent, against a library of HTTP-backed
//! capabilities.
//!
//! A snippet is normalized into a returnable form, statically analyzed for
//! dangerous patterns, and then run inside an isolated QuickJS worker where
//! network primitives are neutralized and the only outbound channel is the
//! adapter-call bridge back to this host.
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

pub mod adapter;
pub mod analyze;
pub mod fetch;
pub mod http_adapter;
pub mod normalize;
pub mod policy;
/// Sandbox orchestration.
pub mod sandbox;
pub mod skill;
pub mod summarize;
pub mod syntax;

/// A named collection of callable methods.
pub use adapter::{Adapter, AdapterRegistry, MethodDescriptor, ParameterSpec, ParameterType};
/// Run the static analyzer directly.
pub use analyze::{analyze, AnalysisReport, Finding};
/// Configuration records shared across the workspace.
pub use capsule_js_common::config::{AnalysisSettings, NetworkPolicy, SandboxSettings, Severity};
/// Result types shared across the workspace.
pub use capsule_js_common::result::{ErrorDetail, ExecutionResult, FailureKind};
/// Run the normalizer directly.
pub use normalize::{normalize, Normalized, SnippetShape};
/// The sandbox orchestrator and the named-task runner.
pub use sandbox::{run_named_task, Sandbox};
/// Named tasks.
pub use skill::{Skill, SkillContext, SkillInput, SkillRegistry};
/// Truncation parameters for result summarization.
pub use summarize::Limits;
/// The syntax predicate and parse errors.
pub use syntax::{validate, ParseError};
