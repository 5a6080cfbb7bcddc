use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::waybill::Waybill;

/// One `<kind>/<name> <action>` line parsed out of `kubectl`/`kustomize`
/// apply output, per spec.md §6. The `(dry run)`/`(server dry run)`
/// suffixes kubectl appends in dry-run modes are stripped before storage
/// here; callers that care about dry-run-ness already know it from the
/// Flag object that produced the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLine {
    pub kind: String,
    pub name: String,
    pub action: String,
}

const DRY_RUN_SUFFIXES: &[&str] = &[" (server dry run)", " (dry run)"];

/// Parses a single line of `kubectl apply` output into a `ResultLine`,
/// or `None` if the line doesn't match the `<kind>/<name> <action>`
/// shape (e.g. `Warning:` lines, blank lines, or other chatter).
pub fn parse_result_line(line: &str) -> Option<ResultLine> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with("Warning:") {
        return None;
    }
    for suffix in DRY_RUN_SUFFIXES {
        if let Some(stripped) = line.strip_suffix(suffix) {
            line = stripped;
            break;
        }
    }
    let (resource, action) = line.split_once(' ')?;
    let (kind, name) = resource.split_once('/')?;
    if kind.is_empty() || name.is_empty() || action.is_empty() {
        return None;
    }
    Some(ResultLine {
        kind: kind.to_owned(),
        name: name.to_owned(),
        action: action.to_owned(),
    })
}

pub fn parse_result_lines(output: &str) -> Vec<ResultLine> {
    output.lines().filter_map(parse_result_line).collect()
}

/// Sink for the operational signals spec.md §6 enumerates. A trait, not a
/// concrete Prometheus registry: wiring an actual exporter is explicitly
/// out of scope (spec.md Non-goals), but the ambient-logging contract
/// still needs somewhere to report to, the same way the teacher always
/// routes through `log` rather than printing directly.
pub trait MetricsSink: Send + Sync {
    fn record_git_sync(&self, success: bool, duration: Duration);
    fn record_run_latency(&self, namespace: &str, duration: Duration, success: bool);
    fn record_last_run_timestamp(&self, namespace: &str, at: DateTime<Utc>);
    fn update_kubectl_exit_code_count(&self, namespace: &str, exit_code: Option<i32>);
    fn update_result_summary(&self, namespace: &str, lines: &[ResultLine]);
    fn reconcile_from_waybill_list(&self, waybills: &[Waybill]);
}

/// Default `MetricsSink`: everything goes through `log`, mirroring the
/// teacher's habit of treating `log` as the baseline observability
/// surface before any richer exporter exists.
#[derive(Default)]
pub struct LoggingMetricsSink {
    state: Mutex<LoggingState>,
}

#[derive(Default)]
struct LoggingState {
    known_namespaces: HashMap<String, ()>,
}

impl MetricsSink for LoggingMetricsSink {
    fn record_git_sync(&self, success: bool, duration: Duration) {
        log::info!("git sync: success={success} duration={duration:?}");
    }

    fn record_run_latency(&self, namespace: &str, duration: Duration, success: bool) {
        log::info!("run latency: namespace={namespace} duration={duration:?} success={success}");
    }

    fn record_last_run_timestamp(&self, namespace: &str, at: DateTime<Utc>) {
        log::info!("last run timestamp: namespace={namespace} at={at}");
    }

    fn update_kubectl_exit_code_count(&self, namespace: &str, exit_code: Option<i32>) {
        log::info!("kubectl exit code: namespace={namespace} exit_code={exit_code:?}");
    }

    fn update_result_summary(&self, namespace: &str, lines: &[ResultLine]) {
        for line in lines {
            log::info!(
                "result summary: namespace={namespace} kind={} name={} action={}",
                line.kind,
                line.name,
                line.action
            );
        }
    }

    fn reconcile_from_waybill_list(&self, waybills: &[Waybill]) {
        let mut state = self.state.lock().expect("metrics state poisoned");
        state.known_namespaces.clear();
        for wb in waybills {
            if let Some(ns) = &wb.metadata.namespace {
                state.known_namespaces.insert(ns.clone(), ());
            }
        }
        log::debug!(
            "metrics reconciled against {} known waybills",
            state.known_namespaces.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_result_line() {
        let parsed = parse_result_line("deployment.apps/web created").unwrap();
        assert_eq!(parsed.kind, "deployment.apps");
        assert_eq!(parsed.name, "web");
        assert_eq!(parsed.action, "created");
    }

    #[test_case::test_case("service/web configured (dry run)", "configured"; "dry run suffix")]
    #[test_case::test_case("service/web configured (server dry run)", "configured"; "server dry run suffix")]
    #[test_case::test_case("service/web unchanged", "unchanged"; "no suffix")]
    fn action_suffix_stripping(line: &str, expected_action: &str) {
        let parsed = parse_result_line(line).unwrap();
        assert_eq!(parsed.action, expected_action);
    }

    #[test]
    fn skips_warning_lines() {
        assert_eq!(parse_result_line("Warning: resource is deprecated"), None);
    }

    #[test]
    fn skips_blank_and_malformed_lines() {
        assert_eq!(parse_result_line(""), None);
        assert_eq!(parse_result_line("not a resource line"), None);
    }

    #[test]
    fn parse_result_lines_filters_non_matching() {
        let output = "deployment.apps/web created\nWarning: deprecated\nservice/web unchanged\n";
        let lines = parse_result_lines(output);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].kind, "service");
    }
}
