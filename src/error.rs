use std::time::Duration;

use thiserror::Error;

/// Typed error taxonomy for the core reconciliation engine.
///
/// Leaf modules return one of these variants; higher-level glue (the
/// Scheduler, the `main` binary) mostly deals in `anyhow::Result` and uses
/// `.context(...)` the way the rest of this codebase does, converting into
/// this type only at the boundaries that need to distinguish error kinds
/// (the Runner, when building a `LastRun` record).
#[derive(Error, Debug)]
pub enum CoreError {
    /// Invalid Waybill spec or missing secret reference. Never retried
    /// without the spec itself changing.
    #[error("config error: {0}")]
    Config(String),

    /// Git mirror sync/clone/diff failure.
    #[error("git error: {0}")]
    Git(String),

    /// Waybill list/get/status/event failure against the apiserver.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Non-zero exit from `kubectl`/`kustomize`, or a spawn failure.
    #[error("apply error (exit code {exit_code:?}): {message}")]
    Apply {
        message: String,
        exit_code: Option<i32>,
    },

    /// Subprocess deadline exceeded. Distinguished from `Apply` so the
    /// metrics sink can count it separately, per the spec's "Timeout is
    /// tagged" requirement.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl CoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout(_))
    }

    /// The exit code to report to the metrics sink, if this failure came
    /// from a subprocess that actually ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CoreError::Apply { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
