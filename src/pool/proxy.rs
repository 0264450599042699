//! Container proxy: one task per container, owning its record and
//! serialising every state transition through its mailbox.
//!
//! Runs themselves execute in spawned tasks so a container with a
//! concurrency limit above one can overlap them; everything that changes
//! container state flows back through the proxy loop.

use std::{
    fmt,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    PoolContext,
    events::{ContainerId, JobSettle, PoolEvent, PoolJob, ProxyMsg, ProxySeed, RemovalReason},
};
use crate::{
    driver::{ContainerHandle, ContainerSpec, DriverError},
    error::ActivationError,
    objects::ActionRef,
    runner,
};

/// One extra create attempt; nothing has run yet, so a fresh container is
/// safe to try.
const CREATE_ATTEMPTS: u32 = 2;

/// Lifecycle state of the owned container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ContainerState {
    Starting,
    Prewarmed,
    Initialized,
    Running,
    Paused,
    Removing,
    Gone,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Starting => "Starting",
            ContainerState::Prewarmed => "Prewarmed",
            ContainerState::Initialized => "Initialized",
            ContainerState::Running => "Running",
            ContainerState::Paused => "Paused",
            ContainerState::Removing => "Removing",
            ContainerState::Gone => "Gone",
        };
        f.write_str(name)
    }
}

/// Sent from a finished run task back into the proxy loop. The settle is
/// forwarded to the pool, which replies to the submitter only after its
/// indices reflect the completion.
struct RunFinished {
    removal: Option<RemovalReason>,
    settle: JobSettle,
}

pub(crate) struct ContainerProxy {
    id: ContainerId,
    ctx: PoolContext,
    spec: ContainerSpec,
    rx: mpsc::UnboundedReceiver<ProxyMsg>,
    pool_tx: mpsc::UnboundedSender<PoolEvent>,
    run_tx: mpsc::UnboundedSender<RunFinished>,
    run_rx: mpsc::UnboundedReceiver<RunFinished>,

    state: ContainerState,
    handle: Option<ContainerHandle>,
    initialized_for: Option<ActionRef>,
    in_flight: u32,
    last_used: Instant,
    removing: Option<RemovalReason>,
    idle_deadline: Option<tokio::time::Instant>,
    mailbox_closed: bool,
}

impl ContainerProxy {
    pub(crate) fn new(
        id: ContainerId,
        ctx: PoolContext,
        spec: ContainerSpec,
        rx: mpsc::UnboundedReceiver<ProxyMsg>,
        pool_tx: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let (run_tx, run_rx) = mpsc::unbounded_channel();
        Self {
            id,
            ctx,
            spec,
            rx,
            pool_tx,
            run_tx,
            run_rx,
            state: ContainerState::Starting,
            handle: None,
            initialized_for: None,
            in_flight: 0,
            last_used: Instant::now(),
            removing: None,
            idle_deadline: None,
            mailbox_closed: false,
        }
    }

    pub(crate) async fn run(mut self, seed: ProxySeed) {
        match self.create_container().await {
            Ok(handle) => {
                debug!(
                    container = %handle.id,
                    kind = %handle.kind,
                    memory_mb = handle.memory_mb,
                    "container ready"
                );
                self.state = ContainerState::Prewarmed;
                let _ = self.pool_tx.send(PoolEvent::Started {
                    id: self.id,
                    result: Ok(handle.clone()),
                });
                self.handle = Some(handle);
                if let ProxySeed::Job(job) = seed {
                    self.start_activation(*job).await;
                }
            }
            Err(e) => {
                warn!(container = %self.spec.name, error = %e, "container create failed");
                let activation_error = match &e {
                    DriverError::Init { diagnostic } => {
                        ActivationError::InitFailure(diagnostic.clone())
                    }
                    other => ActivationError::Internal(other.to_string()),
                };
                let _ = self.pool_tx.send(PoolEvent::Started {
                    id: self.id,
                    result: Err(e),
                });
                if let ProxySeed::Job(job) = seed {
                    let wait_ms = job.item.enqueued_at.elapsed().as_millis() as u64;
                    let record =
                        runner::emit_failure(&self.ctx, &job.item, &activation_error, wait_ms, None)
                            .await;
                    let _ = self.pool_tx.send(PoolEvent::JobFinished {
                        id: self.id,
                        warm: false,
                        last_used: self.last_used,
                        settle: Some(JobSettle {
                            record,
                            reply: job.reply,
                        }),
                    });
                }
                self.state = ContainerState::Gone;
                let _ = self.pool_tx.send(PoolEvent::Destroyed { id: self.id });
                return;
            }
        }

        loop {
            // Checked at the top so a removal flagged by the seed
            // activation (or any select arm) tears the container down
            // without waiting for further traffic.
            if self.removing.is_some() && self.in_flight == 0 {
                self.destroy().await;
                return;
            }

            let idle_at = self
                .idle_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                Some(done) = self.run_rx.recv() => {
                    self.finish_activation(done);
                }
                msg = self.rx.recv(), if !self.mailbox_closed => {
                    match msg {
                        Some(ProxyMsg::Activate(job)) => self.start_activation(job).await,
                        Some(ProxyMsg::Remove { reason }) => self.note_removal(reason),
                        Some(ProxyMsg::ForceRemove) => {
                            self.note_removal(RemovalReason::Shutdown);
                            self.destroy().await;
                            return;
                        }
                        None => {
                            self.mailbox_closed = true;
                            self.note_removal(RemovalReason::Shutdown);
                        }
                    }
                }
                _ = tokio::time::sleep_until(idle_at), if self.idle_deadline.is_some() => {
                    self.idle_expired().await;
                }
            }
        }
    }

    async fn create_container(&self) -> Result<ContainerHandle, DriverError> {
        let mut last_err = None;
        for attempt in 1..=CREATE_ATTEMPTS {
            match self.ctx.driver.create(self.spec.clone()).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(
                        container = %self.spec.name,
                        attempt,
                        error = %e,
                        "create attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::Create("create never attempted".to_string())))
    }

    /// Serialised pre-run phase: resume and init happen inline, then the
    /// run itself is spawned off the mailbox.
    async fn start_activation(&mut self, job: PoolJob) {
        let wait_ms = job.item.enqueued_at.elapsed().as_millis() as u64;

        if self.removing.is_some() {
            self.fail_job(
                job,
                ActivationError::Internal("container is being removed".to_string()),
                wait_ms,
                None,
            )
            .await;
            return;
        }

        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => {
                // Removal is flagged before the job settles so the pool
                // never selects this container in between.
                self.note_removal(RemovalReason::Fatal);
                self.fail_job(
                    job,
                    ActivationError::Internal("container has no handle".to_string()),
                    wait_ms,
                    None,
                )
                .await;
                return;
            }
        };

        if self.state == ContainerState::Paused {
            match self.ctx.driver.resume(&handle).await {
                Ok(()) => {
                    self.state = ContainerState::Initialized;
                    debug!(container = %handle.id, "resumed");
                }
                Err(e) => {
                    // Resume is required before run; a container we cannot
                    // resume is lost.
                    self.note_removal(RemovalReason::Fatal);
                    self.fail_job(
                        job,
                        ActivationError::Internal(format!("resume failed: {}", e)),
                        wait_ms,
                        None,
                    )
                    .await;
                    return;
                }
            }
        }

        let mut init_time = None;
        if self.state == ContainerState::Prewarmed {
            let t0 = Instant::now();
            match self.ctx.driver.init(&handle, &job.item.action.code).await {
                Ok(()) => {
                    init_time = Some(t0.elapsed());
                    self.state = ContainerState::Initialized;
                    self.initialized_for = Some(job.item.action.action.clone());
                    debug!(
                        container = %handle.id,
                        action = %job.item.action.action,
                        init_ms = t0.elapsed().as_millis() as u64,
                        "initialized"
                    );
                }
                Err(e) => {
                    // Nothing has run yet, so the job gets one retry on a
                    // fresh container before the failure is surfaced. The
                    // removal goes out first; the pool then reclaims this
                    // container's memory before re-admitting the job.
                    self.note_removal(RemovalReason::Fatal);
                    if !job.init_retried {
                        warn!(
                            container = %handle.id,
                            error = %e,
                            "init failed, retrying on a fresh container"
                        );
                        let mut job = job;
                        job.init_retried = true;
                        let _ = self.pool_tx.send(PoolEvent::Resubmit { job });
                        return;
                    }
                    let err = match e {
                        DriverError::Init { diagnostic } => ActivationError::InitFailure(diagnostic),
                        other => ActivationError::Internal(other.to_string()),
                    };
                    self.fail_job(job, err, wait_ms, Some(t0.elapsed())).await;
                    return;
                }
            }
        }

        // Assignment affinity is the pool's to uphold; a mismatch here is a
        // selection bug, not a user error.
        if let Some(bound) = &self.initialized_for
            && *bound != job.item.action.action
        {
            debug_assert!(false, "container assigned across actions");
            let err = ActivationError::Internal(format!(
                "container initialized for {} assigned {}",
                bound, job.item.action.action
            ));
            self.note_removal(RemovalReason::Fatal);
            self.fail_job(job, err, wait_ms, None).await;
            return;
        }

        let deadline = Duration::from_millis(
            job.item
                .message
                .remaining_ms()
                .min(job.item.action.time_limit_s * 1000),
        );

        self.state = ContainerState::Running;
        self.in_flight += 1;
        self.idle_deadline = None;

        let ctx = self.ctx.clone();
        let run_tx = self.run_tx.clone();
        let cold = init_time.is_some();
        tokio::spawn(async move {
            let req = runner::RunRequest {
                wait_ms,
                init_time,
                cold,
                deadline,
            };
            let (record, removal) = runner::execute(&ctx, &handle, &job.item, req).await;
            let _ = run_tx.send(RunFinished {
                removal,
                settle: JobSettle {
                    record,
                    reply: job.reply,
                },
            });
        });
    }

    fn finish_activation(&mut self, done: RunFinished) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.last_used = Instant::now();

        let warm = done.removal.is_none() && self.removing.is_none();
        if let Some(reason) = done.removal {
            self.note_removal(reason);
        } else if warm && self.in_flight == 0 {
            self.state = ContainerState::Initialized;
            self.idle_deadline =
                Some(tokio::time::Instant::now() + self.ctx.config.idle_grace());
        }
        let _ = self.pool_tx.send(PoolEvent::JobFinished {
            id: self.id,
            warm,
            last_used: self.last_used,
            settle: Some(done.settle),
        });
    }

    /// Emit the failure record and settle the job without a run.
    async fn fail_job(
        &self,
        job: PoolJob,
        err: ActivationError,
        wait_ms: u64,
        init_time: Option<Duration>,
    ) {
        let record = runner::emit_failure(&self.ctx, &job.item, &err, wait_ms, init_time).await;
        let _ = self.pool_tx.send(PoolEvent::JobFinished {
            id: self.id,
            warm: false,
            last_used: self.last_used,
            settle: Some(JobSettle {
                record,
                reply: job.reply,
            }),
        });
    }

    fn note_removal(&mut self, reason: RemovalReason) {
        if self.removing.is_some() {
            return;
        }
        self.removing = Some(reason);
        self.idle_deadline = None;
        self.state = ContainerState::Removing;
        let _ = self.pool_tx.send(PoolEvent::RemovalRequested {
            id: self.id,
            reason,
        });
    }

    async fn idle_expired(&mut self) {
        self.idle_deadline = None;
        if self.state != ContainerState::Initialized || self.in_flight > 0 {
            return;
        }
        let Some(handle) = self.handle.clone() else {
            return;
        };

        match self.ctx.driver.pause(&handle).await {
            Ok(()) => {
                self.state = ContainerState::Paused;
                debug!(container = %handle.id, "paused after idle grace");
            }
            Err(e) if self.ctx.config.pause_failure_fatal => {
                warn!(container = %handle.id, error = %e, "pause failed, removing");
                self.note_removal(RemovalReason::PauseFailed);
            }
            Err(e) => {
                // Pausing is opportunistic; the container remains usable.
                warn!(container = %handle.id, error = %e, "pause failed, leaving unpaused");
            }
        }
    }

    async fn destroy(&mut self) {
        self.state = ContainerState::Removing;
        if let Some(handle) = self.handle.take() {
            match self.ctx.driver.destroy(&handle).await {
                Ok(()) => {
                    info!(
                        container = %handle.id,
                        reason = ?self.removing,
                        "container destroyed"
                    );
                }
                Err(e) => {
                    // The sandbox is considered lost; its memory was already
                    // released by the pool.
                    warn!(container = %handle.id, error = %e, "destroy failed, container lost");
                }
            }
        }
        self.state = ContainerState::Gone;
        let _ = self.pool_tx.send(PoolEvent::Destroyed { id: self.id });
    }
}
