//! Commands, events, and mailbox messages for the pool and its proxies.
//!
//! All cross-task communication is message passing: the pool owns the
//! proxies' mailbox senders, and proxies reach back only through the pool's
//! event channel.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::{
    driver::{ContainerHandle, DriverError},
    error::ActivationError,
    objects::{ActivationRecord, WorkItem},
};

pub(crate) type ContainerId = u64;

/// One submitted activation plus the channel its outcome travels back on.
///
/// `reply` resolves `Err` only for retryable admission rejections; every
/// accepted activation resolves `Ok` with its record, whatever the status.
pub struct PoolJob {
    pub item: WorkItem,
    pub reply: oneshot::Sender<Result<ActivationRecord, ActivationError>>,
    /// Set once the job has already burned its one fresh-container retry
    /// after an init failure.
    pub(crate) init_retried: bool,
}

/// Commands sent to the pool task.
pub enum PoolCommand {
    Submit(PoolJob),
    Shutdown { done: oneshot::Sender<()> },
}

/// Why a container is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Unrecoverable fault during create/init/run.
    Fatal,
    /// User code exceeded its time limit.
    Timeout,
    /// Idle memory reclaimed for a new container.
    Evicted,
    /// Prewarmed container exceeded its max age.
    AgedPrewarm,
    /// Pause failed and pause failures are configured fatal.
    PauseFailed,
    /// Pool shutdown.
    Shutdown,
}

/// A completed activation's outcome, settled by the pool after it has
/// updated its indices. Replying from the decision loop is what makes "an
/// immediate resubmission is a warm hit" hold: by the time the submitter
/// observes completion, the container is already back in `free`.
pub(crate) struct JobSettle {
    pub record: ActivationRecord,
    pub reply: oneshot::Sender<Result<ActivationRecord, ActivationError>>,
}

/// Events proxies send back to the pool.
pub(crate) enum PoolEvent {
    /// Container creation finished, one way or the other.
    Started {
        id: ContainerId,
        result: Result<ContainerHandle, DriverError>,
    },
    /// One assigned activation completed. `warm: true` means the container
    /// is idle and reusable for its action.
    JobFinished {
        id: ContainerId,
        warm: bool,
        last_used: Instant,
        settle: Option<JobSettle>,
    },
    /// The proxy decided its container must go.
    RemovalRequested {
        id: ContainerId,
        reason: RemovalReason,
    },
    /// The container is gone; the pool can forget it.
    Destroyed { id: ContainerId },
    /// A cold container failed to initialize; run the admission step again
    /// so the job gets one more attempt on a fresh container. Always
    /// preceded by the failing container's `RemovalRequested`, so its
    /// memory is back in the budget before the retry is placed.
    Resubmit { job: PoolJob },
}

/// Messages into a container proxy's mailbox, processed in FIFO order.
pub(crate) enum ProxyMsg {
    /// Run one activation on this container.
    Activate(PoolJob),
    /// Remove after in-flight activations drain.
    Remove { reason: RemovalReason },
    /// Remove immediately, abandoning in-flight activations.
    ForceRemove,
}

/// What to seed a freshly spawned proxy with.
pub(crate) enum ProxySeed {
    /// Create, then immediately serve this activation (cold start).
    Job(Box<PoolJob>),
    /// Create and park as a prewarmed container.
    Prewarm,
}
