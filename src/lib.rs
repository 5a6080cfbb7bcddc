//! Core reconciliation engine for kube-applier-style, Git-driven
//! per-namespace `kubectl apply` orchestration.
//!
//! This crate stays embeddable: it never installs a logger or panics on a
//! user/cluster-induced error. The `main` binary (see `src/main.rs`) owns
//! process-level concerns -- argument parsing, log setup, signal handling.

pub mod apply;
pub mod config;
pub mod error;
pub mod git;
pub mod kube_client;
pub mod metrics;
pub mod process;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod util;
pub mod waybill;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use waybill::{LastRun, RunType, Waybill, WaybillSpec, WaybillStatus};
