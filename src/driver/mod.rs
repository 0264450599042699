//! Sandbox driver capability interface.
//!
//! A driver owns the mechanics of one sandbox runtime (Docker today, others
//! behind the same trait). The pool never assumes anything beyond the error
//! taxonomy defined here; drivers are selected once at process start.

mod docker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use docker::DockerDriver;
use thiserror::Error;

use crate::objects::{CodePayload, LogLine};

/// Marker line the action proxy appends to stdout and stderr when an
/// activation's output is complete. Log collection stops at this line when
/// the runtime emits it.
pub const LOG_SENTINEL: &str = "XXX_THE_END_OF_AN_ACTIVATION_XXX";

/// Errors a run request can fail with. Anything past the first successful
/// byte is a `Connection` failure and fatal for the container.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("response too large: {0} bytes")]
    TooLarge(u64),
}

/// Driver failure taxonomy. The pool classifies activation outcomes from
/// these variants alone.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Container could not be created or never became reachable.
    #[error("container create failed: {0}")]
    Create(String),
    /// `/init` returned non-2xx, timed out, or produced an error body.
    #[error("container init failed: {diagnostic}")]
    Init { diagnostic: String },
    /// `/run` failed; see [`RunError`] for the breakdown.
    #[error(transparent)]
    Run(#[from] RunError),
    /// Anything the driver cannot classify.
    #[error("{0}")]
    Other(String),
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique name for the container within the sandbox runtime.
    pub name: String,
    pub image: String,
    pub kind: String,
    pub memory_mb: u64,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
}

/// Opaque handle to a live container. The proxy owns it exclusively.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    /// Sandbox-runtime identity (container name or id).
    pub id: String,
    /// host:port of the action proxy inside the container.
    pub address: String,
    pub kind: String,
    pub memory_mb: u64,
}

/// Result of one `/run` request.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status_code: u16,
    pub body: String,
    pub truncated: bool,
}

/// Capability interface over a sandbox runtime.
///
/// All operations are idempotent on repeated identical input except
/// `create`. `destroy` is final and must tolerate being called on a
/// container that is already gone.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Create a container and block until it is reachable.
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, DriverError>;

    /// Post user code to the container's `/init` endpoint.
    async fn init(
        &self,
        handle: &ContainerHandle,
        payload: &CodePayload,
    ) -> Result<(), DriverError>;

    /// Post arguments to `/run` with the given deadline.
    async fn run(
        &self,
        handle: &ContainerHandle,
        args: &serde_json::Value,
        deadline: Duration,
    ) -> Result<RunOutcome, DriverError>;

    /// Best-effort suspend. Failure leaves the container usable.
    async fn pause(&self, handle: &ContainerHandle) -> Result<(), DriverError>;

    /// Required to succeed before any further run on a paused container.
    async fn resume(&self, handle: &ContainerHandle) -> Result<(), DriverError>;

    /// Tear the container down. Idempotent.
    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), DriverError>;

    /// Fetch the log lines produced since `since`. A driver that supports
    /// the sentinel convention includes the [`LOG_SENTINEL`] line per stream.
    async fn logs(
        &self,
        handle: &ContainerHandle,
        since: DateTime<Utc>,
    ) -> Result<Vec<LogLine>, DriverError>;

    /// Container ids managed by this driver, for orphan cleanup at startup.
    /// Drivers without enumeration support return an empty list.
    async fn list_containers(&self) -> Result<Vec<String>, DriverError> {
        Ok(Vec::new())
    }
}
