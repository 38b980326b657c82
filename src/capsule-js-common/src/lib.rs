//! Shared types for the capsule-js workspace.
//!
//! Everything that crosses a boundary lives here: the host/worker message
//! protocol, execution results, failure kinds, and the process-wide sandbox
//! configuration record. All of it is plain serde data so values are always
//! marshalled by copy, never by reference.
#![deny(dead_code, missing_docs, unused_mut)]

pub mod config;
pub mod message;
pub mod result;

pub use config::{AnalysisSettings, NetworkPolicy, SandboxSettings, Severity};
pub use message::{AdapterCatalog, HostMessage, WorkerInit, WorkerMessage};
pub use result::{ErrorDetail, ExecutionResult, FailureKind, RunOutcome};

/// Error stacks reported to callers keep at most this many frames.
pub const MAX_STACK_FRAMES: usize = 5;

/// A single run collects at most this many console log lines.
pub const MAX_LOG_LINES: usize = 20;
