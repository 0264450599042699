//! Data model shared across the invoker: actions, invocation messages,
//! activation records, and normalized log lines.

use std::{collections::HashMap, fmt, time::Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of an action: namespace, name, and revision.
///
/// Warm-container affinity is keyed on the full triple; two revisions of the
/// same action never share a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionRef {
    pub namespace: String,
    pub name: String,
    pub revision: String,
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.revision)
    }
}

/// User code plus the environment it runs under, posted to `/init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodePayload {
    pub code: String,
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// An action as fetched from the metadata store: identity, code, and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub action: ActionRef,
    pub code: CodePayload,
    /// Runtime kind governing the container image, e.g. "nodejs:14".
    pub kind: String,
    /// Reserved memory per container, a multiple of the platform granularity.
    pub memory_mb: u64,
    /// Wall-clock limit for a single run, in seconds.
    pub time_limit_s: u64,
    /// Maximum concurrent activations per container, >= 1.
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: u32,
}

fn default_concurrent_limit() -> u32 {
    1
}

/// One invocation request as delivered by the message broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationMessage {
    pub activation_id: String,
    pub namespace: String,
    #[serde(rename = "action_key")]
    pub action: String,
    #[serde(rename = "action_rev")]
    pub revision: String,
    #[serde(default, rename = "args_json")]
    pub args: serde_json::Value,
    pub transid: String,
    /// Absolute deadline, epoch milliseconds. Work still queued past this
    /// point is rejected without touching a container.
    pub deadline_ms: u64,
}

impl InvocationMessage {
    /// Milliseconds left until the deadline, zero if already past.
    pub fn remaining_ms(&self) -> u64 {
        self.deadline_ms.saturating_sub(now_ms())
    }
}

/// A fully resolved unit of work handed from the feed to the pool.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub message: InvocationMessage,
    pub action: ActionDescriptor,
    /// When the feed first saw the message; the basis for waitTime.
    pub enqueued_at: Instant,
}

/// Final classification of one activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "application-error")]
    ApplicationError,
    #[serde(rename = "developer-error")]
    DeveloperError,
    #[serde(rename = "system-error")]
    SystemError,
}

impl ActivationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStatus::Success => "success",
            ActivationStatus::ApplicationError => "application-error",
            ActivationStatus::DeveloperError => "developer-error",
            ActivationStatus::SystemError => "system-error",
        }
    }
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (possibly truncated) response carried in an activation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationResponse {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    pub size: u64,
    pub body: serde_json::Value,
}

/// Annotations attached to every activation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationAnnotations {
    pub kind: String,
    pub memory_mb: u64,
    pub time_limit_s: u64,
    /// Present only for cold activations (container was created or
    /// prewarmed and had to be initialized).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_time_ms: Option<u64>,
    pub wait_time_ms: u64,
    pub cold: bool,
}

/// The record written to the result sink on completion; exactly one per
/// activation, regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub activation_id: String,
    pub namespace: String,
    pub name: String,
    pub subject: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub status: ActivationStatus,
    pub response: ActivationResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_ref: Option<String>,
    pub annotations: ActivationAnnotations,
}

/// Which side of the container a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// A normalized container log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub time: DateTime<Utc>,
    pub stream: LogStream,
    pub log: String,
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
