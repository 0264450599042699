//! Activation runner: drives one run against an assigned container,
//! classifies the outcome, collects logs, and writes the activation record.
//!
//! Resume and init are performed by the container proxy before the run is
//! dispatched here; this module owns everything from `/run` onward plus
//! record construction for failures that never reached a container.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::warn;

use crate::{
    driver::{ContainerHandle, DriverError, LOG_SENTINEL, RunError, RunOutcome},
    error::ActivationError,
    objects::{
        ActionDescriptor, ActivationAnnotations, ActivationRecord, ActivationResponse,
        ActivationStatus, InvocationMessage, LogLine, WorkItem, now_ms,
    },
    pool::{PoolContext, RemovalReason},
};

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-activation context the proxy resolved before dispatching the run.
pub(crate) struct RunRequest {
    pub wait_ms: u64,
    pub init_time: Option<Duration>,
    pub cold: bool,
    pub deadline: Duration,
}

/// Outcome of classification: the record ingredients plus whether the
/// container survives.
struct Classified {
    status: ActivationStatus,
    body: Value,
    truncated: bool,
    removal: Option<RemovalReason>,
}

impl Classified {
    fn success(body: Value, truncated: bool) -> Self {
        Self {
            status: ActivationStatus::Success,
            body,
            truncated,
            removal: None,
        }
    }

    fn failure(err: ActivationError, truncated: bool, removal: Option<RemovalReason>) -> Self {
        Self {
            status: err.status(),
            body: err.response_body(),
            truncated,
            removal,
        }
    }
}

/// Execute the run phase of one activation and emit its record.
/// Returns the record and the removal verdict for the container.
pub(crate) async fn execute(
    ctx: &PoolContext,
    handle: &ContainerHandle,
    item: &WorkItem,
    req: RunRequest,
) -> (ActivationRecord, Option<RemovalReason>) {
    let start_ms = now_ms();
    let run_started = Utc::now();
    let t0 = Instant::now();

    let result = ctx
        .driver
        .run(handle, &item.message.args, req.deadline)
        .await;

    let duration = t0.elapsed();
    let run_ended = Utc::now();
    let end_ms = now_ms();

    let classified = classify_run(result, req.deadline);

    let lines = collect_logs(ctx, handle, run_started, run_ended).await;
    let logs_ref = match ctx
        .sinks
        .logs
        .forward(&item.message.activation_id, &lines)
        .await
    {
        Ok(log_ref) => log_ref,
        Err(e) => {
            warn!(
                activation_id = %item.message.activation_id,
                error = %e,
                "log forwarding failed"
            );
            None
        }
    };

    let size = serde_json::to_vec(&classified.body)
        .map(|v| v.len() as u64)
        .unwrap_or(0);

    let record = ActivationRecord {
        activation_id: item.message.activation_id.clone(),
        namespace: item.message.namespace.clone(),
        name: item.message.action.clone(),
        subject: item.message.namespace.clone(),
        start_ms,
        end_ms,
        status: classified.status,
        response: ActivationResponse {
            truncated: classified.truncated,
            size,
            body: classified.body,
        },
        logs_ref,
        annotations: ActivationAnnotations {
            kind: item.action.kind.clone(),
            memory_mb: item.action.memory_mb,
            time_limit_s: item.action.time_limit_s,
            init_time_ms: req.init_time.map(|d| d.as_millis() as u64),
            wait_time_ms: req.wait_ms,
            cold: req.cold,
        },
    };

    record_metrics(ctx, &record, duration, classified.removal);
    emit(ctx, &record).await;

    (record, classified.removal)
}

/// Build and emit the record for an activation that failed before any run
/// was dispatched (create, resume, or init failure; overload at the feed).
pub(crate) async fn emit_failure(
    ctx: &PoolContext,
    item: &WorkItem,
    err: &ActivationError,
    wait_ms: u64,
    init_time: Option<Duration>,
) -> ActivationRecord {
    let record = failure_record(&item.message, Some(&item.action), err, wait_ms, init_time);
    ctx.metrics.record_activation(record.status);
    ctx.metrics
        .histograms
        .wait_time_ms
        .record(wait_ms as f64, &[]);
    emit(ctx, &record).await;
    record
}

/// Record for an activation that produced no run. Used both by the proxy
/// (pre-run faults) and by the feed (overload, unknown action). `action` is
/// absent when the metadata lookup itself failed.
pub fn failure_record(
    message: &InvocationMessage,
    action: Option<&ActionDescriptor>,
    err: &ActivationError,
    wait_ms: u64,
    init_time: Option<Duration>,
) -> ActivationRecord {
    let now = now_ms();
    let body = err.response_body();
    let size = serde_json::to_vec(&body).map(|v| v.len() as u64).unwrap_or(0);
    ActivationRecord {
        activation_id: message.activation_id.clone(),
        namespace: message.namespace.clone(),
        name: message.action.clone(),
        subject: message.namespace.clone(),
        start_ms: now,
        end_ms: now,
        status: err.status(),
        response: ActivationResponse {
            truncated: false,
            size,
            body,
        },
        logs_ref: None,
        annotations: ActivationAnnotations {
            kind: action.map(|a| a.kind.clone()).unwrap_or_default(),
            memory_mb: action.map(|a| a.memory_mb).unwrap_or(0),
            time_limit_s: action.map(|a| a.time_limit_s).unwrap_or(0),
            init_time_ms: init_time.map(|d| d.as_millis() as u64),
            wait_time_ms: wait_ms,
            cold: init_time.is_some(),
        },
    }
}

async fn emit(ctx: &PoolContext, record: &ActivationRecord) {
    if let Err(e) = ctx.sinks.results.record(record).await {
        warn!(
            activation_id = %record.activation_id,
            error = %e,
            "failed to write activation record"
        );
    }
}

fn record_metrics(
    ctx: &PoolContext,
    record: &ActivationRecord,
    duration: Duration,
    removal: Option<RemovalReason>,
) {
    let metrics = &ctx.metrics;
    metrics.record_activation(record.status);
    if record.annotations.cold {
        metrics.counters.cold_starts.add(1, &[]);
    }
    if removal == Some(RemovalReason::Timeout) {
        metrics.counters.timed_limit_hits.add(1, &[]);
    }
    metrics
        .histograms
        .wait_time_ms
        .record(record.annotations.wait_time_ms as f64, &[]);
    if let Some(init_ms) = record.annotations.init_time_ms {
        metrics.histograms.init_time_ms.record(init_ms as f64, &[]);
    }
    metrics
        .histograms
        .run_duration_ms
        .record(duration.as_millis() as f64, &[]);
    metrics
        .histograms
        .response_size_bytes
        .record(record.response.size as f64, &[]);
}

/// Map a run result onto the pool's error taxonomy and a container verdict.
fn classify_run(result: Result<RunOutcome, DriverError>, deadline: Duration) -> Classified {
    match result {
        Ok(outcome) => classify_response(outcome),
        Err(DriverError::Run(RunError::Timeout(_))) => Classified::failure(
            ActivationError::Timeout(deadline.as_millis() as u64),
            false,
            Some(RemovalReason::Timeout),
        ),
        Err(DriverError::Run(RunError::TooLarge(bytes))) => Classified::failure(
            ActivationError::DeveloperError(json!({
                "error": format!("The action produced a response exceeding the allowed {} bytes.", bytes)
            })),
            true,
            Some(RemovalReason::Fatal),
        ),
        Err(DriverError::Run(RunError::Connection(detail))) => Classified::failure(
            ActivationError::Internal(format!(
                "connection to the action container failed: {}",
                detail
            )),
            false,
            Some(RemovalReason::Fatal),
        ),
        Err(other) => Classified::failure(
            ActivationError::Internal(other.to_string()),
            false,
            Some(RemovalReason::Fatal),
        ),
    }
}

fn classify_response(outcome: RunOutcome) -> Classified {
    let RunOutcome {
        status_code,
        body,
        truncated,
    } = outcome;

    if status_code == 204 || (status_code < 300 && body.trim().is_empty()) {
        return Classified::failure(
            ActivationError::DeveloperError(
                json!({ "error": "The action did not produce a valid response." }),
            ),
            false,
            Some(RemovalReason::Fatal),
        );
    }

    if (200..300).contains(&status_code) {
        return match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map)) => {
                if map.contains_key("error") {
                    // User code reported its own failure; the container is
                    // still healthy and stays warm.
                    Classified::failure(
                        ActivationError::ApplicationError(Value::Object(map)),
                        truncated,
                        None,
                    )
                } else {
                    Classified::success(Value::Object(map), truncated)
                }
            }
            _ => Classified::failure(
                ActivationError::DeveloperError(
                    json!({ "error": "The action did not return a dictionary." }),
                ),
                truncated,
                Some(RemovalReason::Fatal),
            ),
        };
    }

    // Non-2xx: surface whatever diagnostics the container gave us.
    let body = match serde_json::from_str::<Value>(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ "error": body }),
    };
    Classified::failure(
        ActivationError::DeveloperError(body),
        truncated,
        Some(RemovalReason::Fatal),
    )
}

/// Fetch this activation's log lines, waiting a bounded time for the
/// sentinel on both streams and falling back to a timestamp cutoff.
async fn collect_logs(
    ctx: &PoolContext,
    handle: &ContainerHandle,
    since: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> Vec<LogLine> {
    let deadline = Instant::now() + ctx.config.log_collect_timeout();

    loop {
        let lines = match ctx.driver.logs(handle, since).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(container = %handle.id, error = %e, "log collection failed");
                return Vec::new();
            }
        };

        if let Some(complete) = trim_at_sentinel(&lines) {
            return complete;
        }
        if Instant::now() >= deadline {
            // Sentinel never arrived; cut off at the run-end timestamp.
            return lines
                .into_iter()
                .filter(|l| l.time <= cutoff && l.log != LOG_SENTINEL)
                .collect();
        }
        tokio::time::sleep(LOG_POLL_INTERVAL).await;
    }
}

/// If both streams have reached their sentinel, return everything before
/// them; otherwise the activation's output is still incomplete.
fn trim_at_sentinel(lines: &[LogLine]) -> Option<Vec<LogLine>> {
    let stdout_done = lines
        .iter()
        .any(|l| l.stream == crate::objects::LogStream::Stdout && l.log == LOG_SENTINEL);
    let stderr_done = lines
        .iter()
        .any(|l| l.stream == crate::objects::LogStream::Stderr && l.log == LOG_SENTINEL);
    if !stdout_done || !stderr_done {
        return None;
    }

    let mut out = Vec::with_capacity(lines.len());
    let mut stdout_open = true;
    let mut stderr_open = true;
    for line in lines {
        let open = match line.stream {
            crate::objects::LogStream::Stdout => &mut stdout_open,
            crate::objects::LogStream::Stderr => &mut stderr_open,
        };
        if line.log == LOG_SENTINEL {
            *open = false;
            continue;
        }
        if *open {
            out.push(line.clone());
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::LogStream;

    fn run_ok(status_code: u16, body: &str) -> Result<RunOutcome, DriverError> {
        Ok(RunOutcome {
            status_code,
            body: body.to_string(),
            truncated: false,
        })
    }

    #[test]
    fn test_classify_success() {
        let c = classify_run(run_ok(200, r#"{"greeting":"hi"}"#), Duration::from_secs(1));
        assert_eq!(c.status, ActivationStatus::Success);
        assert!(c.removal.is_none());
    }

    #[test]
    fn test_classify_application_error_keeps_container() {
        let c = classify_run(run_ok(200, r#"{"error":"boom"}"#), Duration::from_secs(1));
        assert_eq!(c.status, ActivationStatus::ApplicationError);
        assert!(c.removal.is_none());
        assert_eq!(c.body["error"], "boom");
    }

    #[test]
    fn test_classify_non_dictionary_result() {
        let c = classify_run(run_ok(200, "42"), Duration::from_secs(1));
        assert_eq!(c.status, ActivationStatus::DeveloperError);
        assert_eq!(c.removal, Some(RemovalReason::Fatal));
    }

    #[test]
    fn test_classify_no_response() {
        let c = classify_run(run_ok(204, ""), Duration::from_secs(1));
        assert_eq!(c.status, ActivationStatus::DeveloperError);
        assert_eq!(c.removal, Some(RemovalReason::Fatal));
    }

    #[test]
    fn test_classify_server_error() {
        let c = classify_run(
            run_ok(502, r#"{"error":"The action failed to locate a binary."}"#),
            Duration::from_secs(1),
        );
        assert_eq!(c.status, ActivationStatus::DeveloperError);
        assert_eq!(c.removal, Some(RemovalReason::Fatal));
        assert!(c.body["error"].as_str().unwrap().contains("binary"));
    }

    #[test]
    fn test_classify_timeout() {
        let c = classify_run(
            Err(RunError::Timeout(Duration::from_secs(1)).into()),
            Duration::from_secs(1),
        );
        assert_eq!(c.status, ActivationStatus::SystemError);
        assert_eq!(c.removal, Some(RemovalReason::Timeout));
    }

    #[test]
    fn test_classify_connection_failure() {
        let c = classify_run(
            Err(RunError::Connection("reset by peer".to_string()).into()),
            Duration::from_secs(1),
        );
        assert_eq!(c.status, ActivationStatus::SystemError);
        assert_eq!(c.removal, Some(RemovalReason::Fatal));
    }

    fn line(stream: LogStream, log: &str) -> LogLine {
        LogLine {
            time: Utc::now(),
            stream,
            log: log.to_string(),
        }
    }

    #[test]
    fn test_trim_at_sentinel_requires_both_streams() {
        let lines = vec![
            line(LogStream::Stdout, "hello"),
            line(LogStream::Stdout, LOG_SENTINEL),
        ];
        assert!(trim_at_sentinel(&lines).is_none());
    }

    #[test]
    fn test_trim_at_sentinel_drops_markers_and_tail() {
        let lines = vec![
            line(LogStream::Stdout, "hello"),
            line(LogStream::Stderr, "oops"),
            line(LogStream::Stdout, LOG_SENTINEL),
            line(LogStream::Stderr, LOG_SENTINEL),
            line(LogStream::Stdout, "next activation noise"),
        ];
        let trimmed = trim_at_sentinel(&lines).unwrap();
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].log, "hello");
        assert_eq!(trimmed[1].log, "oops");
    }
}
