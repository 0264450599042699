//! Container pool: admission, selection, eviction, and prewarm management.
//!
//! The pool is one task with a command mailbox and an event channel from
//! its proxies, multiplexed through a single `select!` loop. That loop is
//! the serialisation point: the free/busy/prewarm indices and the memory
//! accountant are touched nowhere else, so admission decisions never
//! observe a half-applied transition. Container creation, init, runs, and
//! destruction all happen in other tasks.

mod accountant;
pub(crate) mod events;
pub(crate) mod proxy;

use std::{collections::HashMap, sync::Arc, time::Instant};

pub use accountant::{AccountantCorruption, ResourceAccountant};
pub use events::{PoolCommand, PoolJob, RemovalReason};
use events::{ContainerId, JobSettle, PoolEvent, ProxyMsg, ProxySeed};
use proxy::ContainerProxy;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::InvokerConfig,
    driver::{ContainerSpec, SandboxDriver},
    error::ActivationError,
    metrics::InvokerMetrics,
    objects::{ActionRef, ActivationRecord, WorkItem},
    runner,
    store::Sinks,
};

/// Default interval for checking prewarm pools for aged-out containers.
const PREWARM_TICK: std::time::Duration = std::time::Duration::from_secs(10);

/// Floor for the aging check interval.
const PREWARM_TICK_MIN: std::time::Duration = std::time::Duration::from_millis(250);

/// Shared dependencies threaded through the pool, its proxies, and the
/// runner. No ambient globals; everything a component needs arrives here.
#[derive(Clone)]
pub struct PoolContext {
    pub driver: Arc<dyn SandboxDriver>,
    pub metrics: Arc<InvokerMetrics>,
    pub sinks: Sinks,
    pub config: Arc<InvokerConfig>,
}

/// Cloneable handle for submitting work and shutting the pool down.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    /// Submit one work item. Resolves `Ok(record)` for every activation the
    /// pool accepted, whatever its status; `Err(SystemOverloaded)` is a
    /// retryable admission rejection.
    pub async fn submit(&self, item: WorkItem) -> Result<ActivationRecord, ActivationError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Submit(PoolJob {
                item,
                reply,
                init_retried: false,
            }))
            .map_err(|_| ActivationError::SystemOverloaded)?;
        rx.await
            .map_err(|_| ActivationError::Internal("pool dropped the submission".to_string()))?
    }

    /// Stop accepting work, drain in-flight activations, destroy all
    /// containers. Resolves when the pool is empty.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// What the pool tracks per container. The proxy owns the live record;
/// this is the index entry the decision step works from.
struct TrackedContainer {
    tx: mpsc::UnboundedSender<ProxyMsg>,
    kind: String,
    memory_mb: u64,
    /// Whether this container's memory is still counted in the accountant.
    accounted: bool,
    created_at: Instant,
    phase: Phase,
}

enum Phase {
    /// Create in progress. `action` is set for job-seeded cold starts.
    Starting {
        action: Option<ActionRef>,
        concurrent_limit: u32,
    },
    /// Booted, no user code yet.
    FreePrewarmed { since: Instant },
    /// Idle and initialized for an action.
    FreeWarm {
        action: ActionRef,
        concurrent_limit: u32,
        last_used: Instant,
    },
    /// At least one activation in flight.
    Busy {
        action: ActionRef,
        concurrent_limit: u32,
        in_flight: u32,
    },
    /// On its way out; not selectable, memory already released.
    Removing,
}

enum DrainPhase {
    Draining,
    Forced,
}

struct Drain {
    done: Vec<oneshot::Sender<()>>,
    deadline: tokio::time::Instant,
    phase: DrainPhase,
}

pub struct ContainerPool {
    ctx: PoolContext,
    command_rx: mpsc::UnboundedReceiver<PoolCommand>,
    event_tx: mpsc::UnboundedSender<PoolEvent>,
    event_rx: mpsc::UnboundedReceiver<PoolEvent>,
    containers: HashMap<ContainerId, TrackedContainer>,
    accountant: ResourceAccountant,
    next_id: ContainerId,
    draining: Option<Drain>,
}

impl ContainerPool {
    /// Build the pool and its handle. Call [`ContainerPool::run`] on a task
    /// to start it.
    pub fn new(ctx: PoolContext) -> (Self, PoolHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let limit = ctx.config.memory_limit_mb;
        let pool = Self {
            ctx,
            command_rx,
            event_tx,
            event_rx,
            containers: HashMap::new(),
            accountant: ResourceAccountant::new(limit),
            next_id: 0,
            draining: None,
        };
        (pool, PoolHandle { tx: command_tx })
    }

    /// Spawn the pool onto the runtime and return its handle.
    pub fn spawn(ctx: PoolContext) -> (PoolHandle, tokio::task::JoinHandle<Result<(), AccountantCorruption>>) {
        let (pool, handle) = Self::new(ctx);
        let join = tokio::spawn(pool.run());
        (handle, join)
    }

    /// The pool's decision loop. Returns an error only on accounting
    /// corruption, which the process wrapper turns into a dedicated exit
    /// code.
    pub async fn run(mut self) -> Result<(), AccountantCorruption> {
        info!(
            memory_limit_mb = self.accountant.limit_mb(),
            prewarm_pools = self.ctx.config.prewarm.len(),
            "container pool starting"
        );
        self.refill_prewarm();

        // Check often enough to notice the shortest configured max age.
        let tick_period = self
            .ctx
            .config
            .prewarm
            .iter()
            .filter_map(|s| s.max_age())
            .min()
            .map(|age| (age / 4).clamp(PREWARM_TICK_MIN, PREWARM_TICK))
            .unwrap_or(PREWARM_TICK);
        let mut prewarm_tick = tokio::time::interval(tick_period);
        prewarm_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let drain_deadline = self.draining.as_ref().map(|d| d.deadline);
            let far_off = tokio::time::Instant::now() + std::time::Duration::from_secs(3600);

            tokio::select! {
                // Completions are indexed before new admissions so a
                // decision never runs against state it could already know
                // is stale.
                biased;
                Some(event) = self.event_rx.recv() => self.handle_event(event)?,
                Some(cmd) = self.command_rx.recv() => match cmd {
                    PoolCommand::Submit(job) => self.handle_submit(job)?,
                    PoolCommand::Shutdown { done } => self.begin_drain(done)?,
                },
                _ = prewarm_tick.tick() => {
                    if self.draining.is_none() {
                        self.age_out_prewarms()?;
                    }
                }
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or(far_off)),
                        if drain_deadline.is_some() => {
                    self.force_drain();
                }
            }

            if let Some(drain) = &mut self.draining
                && self.containers.is_empty()
            {
                for done in drain.done.drain(..) {
                    let _ = done.send(());
                }
                info!(
                    memory_used_mb = self.accountant.used_mb(),
                    "container pool drained"
                );
                return Ok(());
            }
        }
    }

    // -- Admission ----------------------------------------------------------

    fn handle_submit(&mut self, job: PoolJob) -> Result<(), AccountantCorruption> {
        if self.draining.is_some() {
            let _ = job.reply.send(Err(ActivationError::SystemOverloaded));
            return Ok(());
        }
        if job.item.message.remaining_ms() == 0 {
            // Expired while queued; rejected without touching a container.
            let _ = job.reply.send(Err(ActivationError::SystemOverloaded));
            return Ok(());
        }

        let action = &job.item.action;
        if action.memory_mb > self.accountant.limit_mb() {
            let _ = job.reply.send(Err(ActivationError::SystemOverloaded));
            return Ok(());
        }

        // 1. Exact warm hit among idle containers, most recently used first.
        if let Some(id) = self.best_free_warm(action.kind.as_str(), &action.action) {
            self.assign_to_free(id, job);
            self.refill_prewarm();
            return Ok(());
        }

        // 1b. A busy container already bound to the action, when its
        // concurrency limit leaves room.
        match self.busy_with_capacity(&action.action) {
            BusyLookup::Available(id) => {
                self.assign_to_busy(id, job);
                return Ok(());
            }
            BusyLookup::AllAtLimit => {
                self.ctx.metrics.counters.concurrent_limit_hits.add(1, &[]);
            }
            BusyLookup::None => {}
        }

        // 2. A prewarmed container of the right kind and size.
        if let Some(id) = self.free_prewarmed(action.kind.as_str(), action.memory_mb) {
            self.assign_to_free(id, job);
            self.refill_prewarm();
            return Ok(());
        }

        // 3. Create, evicting idle memory if the budget is short.
        let shortfall = self.reserve(action.memory_mb);
        if shortfall > 0 {
            if !self.evict_idle(shortfall)? {
                debug!(
                    action = %action.action,
                    needed_mb = action.memory_mb,
                    shortfall_mb = shortfall,
                    "admission rejected, not enough reclaimable memory"
                );
                let _ = job.reply.send(Err(ActivationError::SystemOverloaded));
                return Ok(());
            }
            let still_short = self.reserve(action.memory_mb);
            if still_short > 0 {
                let _ = job.reply.send(Err(ActivationError::SystemOverloaded));
                return Ok(());
            }
        }

        self.spawn_container(ProxySeed::Job(Box::new(job)));
        self.refill_prewarm();
        Ok(())
    }

    fn best_free_warm(&self, kind: &str, action: &ActionRef) -> Option<ContainerId> {
        self.containers
            .iter()
            .filter_map(|(id, c)| match &c.phase {
                Phase::FreeWarm {
                    action: bound,
                    last_used,
                    ..
                } if bound == action && c.kind == kind => Some((*id, *last_used)),
                _ => None,
            })
            .max_by_key(|(_, last_used)| *last_used)
            .map(|(id, _)| id)
    }

    fn busy_with_capacity(&self, action: &ActionRef) -> BusyLookup {
        let mut saw_bound = false;
        let mut best: Option<ContainerId> = None;
        for (id, c) in &self.containers {
            if let Phase::Busy {
                action: bound,
                concurrent_limit,
                in_flight,
            } = &c.phase
                && bound == action
            {
                saw_bound = true;
                if in_flight < concurrent_limit {
                    best = Some(*id);
                    break;
                }
            }
        }
        match (best, saw_bound) {
            (Some(id), _) => BusyLookup::Available(id),
            (None, true) => BusyLookup::AllAtLimit,
            (None, false) => BusyLookup::None,
        }
    }

    fn free_prewarmed(&self, kind: &str, memory_mb: u64) -> Option<ContainerId> {
        self.containers
            .iter()
            .filter_map(|(id, c)| match &c.phase {
                Phase::FreePrewarmed { .. } if c.kind == kind && c.memory_mb == memory_mb => {
                    Some(*id)
                }
                _ => None,
            })
            .next()
    }

    fn assign_to_free(&mut self, id: ContainerId, job: PoolJob) {
        let action = job.item.action.action.clone();
        let limit = job.item.action.concurrent_limit;
        if let Some(c) = self.containers.get_mut(&id) {
            c.phase = Phase::Busy {
                action,
                concurrent_limit: limit.max(1),
                in_flight: 1,
            };
            self.ctx.metrics.gauges.containers_free.add(-1, &[]);
            self.ctx.metrics.gauges.containers_busy.add(1, &[]);
            let _ = c.tx.send(ProxyMsg::Activate(job));
        } else {
            let _ = job.reply.send(Err(ActivationError::SystemOverloaded));
        }
    }

    fn assign_to_busy(&mut self, id: ContainerId, job: PoolJob) {
        if let Some(c) = self.containers.get_mut(&id)
            && let Phase::Busy { in_flight, .. } = &mut c.phase
        {
            *in_flight += 1;
            let _ = c.tx.send(ProxyMsg::Activate(job));
        } else {
            let _ = job.reply.send(Err(ActivationError::SystemOverloaded));
        }
    }

    // -- Eviction -----------------------------------------------------------

    /// Evict idle containers until at least `needed_mb` is reclaimed.
    /// Returns false, evicting nothing, when the idle set cannot cover it.
    fn evict_idle(&mut self, needed_mb: u64) -> Result<bool, AccountantCorruption> {
        let mut candidates: Vec<(ContainerId, Instant, Instant, u64)> = self
            .containers
            .iter()
            .filter_map(|(id, c)| match &c.phase {
                Phase::FreeWarm { last_used, .. } => {
                    Some((*id, *last_used, c.created_at, c.memory_mb))
                }
                _ => None,
            })
            .collect();

        if self.ctx.config.eviction_lru {
            candidates.sort_by_key(|(_, last_used, _, _)| *last_used);
        } else {
            candidates.sort_by_key(|(_, _, created_at, _)| *created_at);
        }

        let reclaimable: u64 = candidates.iter().map(|(_, _, _, mb)| mb).sum();
        if reclaimable < needed_mb {
            return Ok(false);
        }

        let mut reclaimed = 0;
        for (id, _, _, memory_mb) in candidates {
            if reclaimed >= needed_mb {
                break;
            }
            debug!(container_id = id, memory_mb, "evicting idle container");
            self.remove_container(id, RemovalReason::Evicted)?;
            reclaimed += memory_mb;
        }
        Ok(true)
    }

    /// Release the container's memory, mark it Removing, and tell its proxy
    /// to destroy itself.
    fn remove_container(
        &mut self,
        id: ContainerId,
        reason: RemovalReason,
    ) -> Result<(), AccountantCorruption> {
        let Some(c) = self.containers.get_mut(&id) else {
            return Ok(());
        };
        match &c.phase {
            Phase::Removing => return Ok(()),
            Phase::FreeWarm { .. } | Phase::FreePrewarmed { .. } => {
                self.ctx.metrics.gauges.containers_free.add(-1, &[]);
            }
            Phase::Busy { .. } => {
                self.ctx.metrics.gauges.containers_busy.add(-1, &[]);
            }
            Phase::Starting { .. } => {}
        }
        c.phase = Phase::Removing;
        let _ = c.tx.send(ProxyMsg::Remove { reason });
        if c.accounted {
            c.accounted = false;
            let memory_mb = c.memory_mb;
            self.release(memory_mb)?;
        }
        Ok(())
    }

    // -- Creation & prewarm -------------------------------------------------

    fn spawn_container(&mut self, seed: ProxySeed) {
        let (kind, memory_mb, action, limit) = match &seed {
            ProxySeed::Job(job) => (
                job.item.action.kind.clone(),
                job.item.action.memory_mb,
                Some(job.item.action.action.clone()),
                job.item.action.concurrent_limit.max(1),
            ),
            ProxySeed::Prewarm => unreachable!("prewarm seeds go through spawn_prewarm"),
        };
        self.spawn_container_inner(kind, memory_mb, action, limit, seed);
    }

    fn spawn_prewarm(&mut self, kind: String, memory_mb: u64) {
        self.ctx.metrics.counters.prewarm_refills.add(1, &[]);
        self.spawn_container_inner(kind, memory_mb, None, 1, ProxySeed::Prewarm);
    }

    fn spawn_container_inner(
        &mut self,
        kind: String,
        memory_mb: u64,
        action: Option<ActionRef>,
        concurrent_limit: u32,
        seed: ProxySeed,
    ) {
        let Some(image) = self.ctx.config.runtime_image(&kind).map(str::to_string) else {
            // No image for this kind: settle the job (if any) and put the
            // reservation back.
            warn!(kind = %kind, "no runtime image configured");
            if let Err(e) = self.release(memory_mb) {
                // Unreachable in practice: we reserved this amount moments
                // ago inside the same decision step.
                warn!(error = %e, "release after failed spawn");
            }
            if let ProxySeed::Job(job) = seed {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    let wait_ms = job.item.enqueued_at.elapsed().as_millis() as u64;
                    let err = ActivationError::Internal(format!(
                        "no runtime image configured for kind {}",
                        job.item.action.kind
                    ));
                    let record = runner::emit_failure(&ctx, &job.item, &err, wait_ms, None).await;
                    let _ = job.reply.send(Ok(record));
                });
            }
            return;
        };

        let id = self.next_id;
        self.next_id += 1;

        let name = format!(
            "invokerd-{}-{}",
            kind.replace([':', '/'], "-"),
            Uuid::new_v4().simple()
        );
        let spec = ContainerSpec {
            name,
            image,
            kind: kind.clone(),
            memory_mb,
            env: Vec::new(),
            labels: vec![("invokerd.kind".to_string(), kind.clone())],
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.containers.insert(
            id,
            TrackedContainer {
                tx,
                kind,
                memory_mb,
                accounted: true,
                created_at: Instant::now(),
                phase: Phase::Starting {
                    action,
                    concurrent_limit,
                },
            },
        );

        let proxy = ContainerProxy::new(id, self.ctx.clone(), spec, rx, self.event_tx.clone());
        tokio::spawn(proxy.run(seed));
    }

    /// Top prewarm pools back up to their targets, but only from spare
    /// budget; prewarming never evicts and never outbids real work.
    fn refill_prewarm(&mut self) {
        if self.draining.is_some() {
            return;
        }
        let specs = self.ctx.config.prewarm.clone();
        for spec in specs {
            loop {
                let existing = self
                    .containers
                    .values()
                    .filter(|c| {
                        c.kind == spec.kind
                            && c.memory_mb == spec.memory_mb
                            && matches!(
                                c.phase,
                                Phase::FreePrewarmed { .. }
                                    | Phase::Starting { action: None, .. }
                            )
                    })
                    .count();
                if existing >= spec.count {
                    break;
                }
                if self.reserve(spec.memory_mb) > 0 {
                    break;
                }
                self.spawn_prewarm(spec.kind.clone(), spec.memory_mb);
            }
        }
    }

    /// Destroy prewarmed containers past their max age; replacements come
    /// from the refill that follows.
    fn age_out_prewarms(&mut self) -> Result<(), AccountantCorruption> {
        let aged: Vec<ContainerId> = self
            .containers
            .iter()
            .filter_map(|(id, c)| {
                let Phase::FreePrewarmed { since } = &c.phase else {
                    return None;
                };
                let max_age = self
                    .ctx
                    .config
                    .prewarm
                    .iter()
                    .find(|s| s.kind == c.kind && s.memory_mb == c.memory_mb)
                    .and_then(|s| s.max_age());
                match max_age {
                    Some(age) if since.elapsed() > age => Some(*id),
                    _ => None,
                }
            })
            .collect();

        for id in aged {
            debug!(container_id = id, "prewarmed container aged out");
            self.remove_container(id, RemovalReason::AgedPrewarm)?;
        }
        self.refill_prewarm();
        Ok(())
    }

    // -- Events -------------------------------------------------------------

    fn handle_event(&mut self, event: PoolEvent) -> Result<(), AccountantCorruption> {
        match event {
            PoolEvent::Started { id, result } => self.handle_started(id, result),
            PoolEvent::JobFinished {
                id,
                warm,
                last_used,
                settle,
            } => {
                self.handle_job_finished(id, warm, last_used);
                // Reply only now, with the indices updated: a submitter that
                // observes completion can immediately warm-hit this
                // container.
                if let Some(JobSettle { record, reply }) = settle {
                    let _ = reply.send(Ok(record));
                }
                Ok(())
            }
            PoolEvent::RemovalRequested { id, reason } => {
                debug!(container_id = id, ?reason, "proxy requested removal");
                self.release_tracking(id)
            }
            PoolEvent::Destroyed { id } => {
                self.ctx.metrics.counters.containers_destroyed.add(1, &[]);
                self.containers.remove(&id);
                Ok(())
            }
            // One more pass through admission; the job carries the marker
            // that stops a second retry.
            PoolEvent::Resubmit { job } => self.handle_submit(job),
        }
    }

    fn handle_started(
        &mut self,
        id: ContainerId,
        result: Result<crate::driver::ContainerHandle, crate::driver::DriverError>,
    ) -> Result<(), AccountantCorruption> {
        match result {
            Ok(_handle) => {
                self.ctx.metrics.counters.containers_created.add(1, &[]);
                if let Some(c) = self.containers.get_mut(&id) {
                    match std::mem::replace(&mut c.phase, Phase::Removing) {
                        Phase::Starting {
                            action: Some(action),
                            concurrent_limit,
                        } => {
                            c.phase = Phase::Busy {
                                action,
                                concurrent_limit,
                                in_flight: 1,
                            };
                            self.ctx.metrics.gauges.containers_busy.add(1, &[]);
                        }
                        Phase::Starting { action: None, .. } => {
                            c.phase = Phase::FreePrewarmed {
                                since: Instant::now(),
                            };
                            self.ctx.metrics.gauges.containers_free.add(1, &[]);
                        }
                        other => {
                            // A removal raced the startup; keep the phase.
                            c.phase = other;
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(container_id = id, error = %e, "container never started");
                self.release_tracking(id)
            }
        }
    }

    fn handle_job_finished(&mut self, id: ContainerId, warm: bool, last_used: Instant) {
        let Some(c) = self.containers.get_mut(&id) else {
            return;
        };
        if let Phase::Busy {
            action,
            concurrent_limit,
            in_flight,
        } = &mut c.phase
        {
            *in_flight = in_flight.saturating_sub(1);
            if *in_flight == 0 {
                if warm {
                    c.phase = Phase::FreeWarm {
                        action: action.clone(),
                        concurrent_limit: *concurrent_limit,
                        last_used,
                    };
                    self.ctx.metrics.gauges.containers_busy.add(-1, &[]);
                    self.ctx.metrics.gauges.containers_free.add(1, &[]);
                }
                // A non-warm finish leaves the phase to the removal event
                // that precedes it.
            }
        }
    }

    /// Mark a container Removing and release its memory, once.
    fn release_tracking(&mut self, id: ContainerId) -> Result<(), AccountantCorruption> {
        let Some(c) = self.containers.get_mut(&id) else {
            return Ok(());
        };
        match &c.phase {
            Phase::Removing => {}
            Phase::FreeWarm { .. } | Phase::FreePrewarmed { .. } => {
                self.ctx.metrics.gauges.containers_free.add(-1, &[]);
            }
            Phase::Busy { .. } => {
                self.ctx.metrics.gauges.containers_busy.add(-1, &[]);
            }
            Phase::Starting { .. } => {}
        }
        c.phase = Phase::Removing;
        if c.accounted {
            c.accounted = false;
            let memory_mb = c.memory_mb;
            self.release(memory_mb)?;
        }
        Ok(())
    }

    // -- Shutdown -----------------------------------------------------------

    fn begin_drain(&mut self, done: oneshot::Sender<()>) -> Result<(), AccountantCorruption> {
        if let Some(drain) = &mut self.draining {
            drain.done.push(done);
            return Ok(());
        }
        info!(
            containers = self.containers.len(),
            "container pool draining"
        );
        self.draining = Some(Drain {
            done: vec![done],
            deadline: tokio::time::Instant::now() + self.ctx.config.shutdown_grace(),
            phase: DrainPhase::Draining,
        });

        let ids: Vec<ContainerId> = self.containers.keys().copied().collect();
        for id in ids {
            self.remove_container(id, RemovalReason::Shutdown)?;
        }
        Ok(())
    }

    fn force_drain(&mut self) {
        let Some(drain) = &mut self.draining else {
            return;
        };
        if matches!(drain.phase, DrainPhase::Forced) {
            return;
        }
        drain.phase = DrainPhase::Forced;
        drain.deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3600);
        warn!(
            remaining = self.containers.len(),
            "drain grace expired, force-destroying containers"
        );
        for c in self.containers.values() {
            let _ = c.tx.send(ProxyMsg::ForceRemove);
        }
    }

    // -- Accounting with gauge upkeep ---------------------------------------

    fn reserve(&mut self, mb: u64) -> u64 {
        let shortfall = self.accountant.try_reserve(mb);
        if shortfall == 0 {
            self.ctx.metrics.gauges.memory_used_mb.add(mb as i64, &[]);
        }
        shortfall
    }

    fn release(&mut self, mb: u64) -> Result<(), AccountantCorruption> {
        self.accountant.release(mb)?;
        self.ctx.metrics.gauges.memory_used_mb.add(-(mb as i64), &[]);
        Ok(())
    }
}

enum BusyLookup {
    Available(ContainerId),
    AllAtLimit,
    None,
}
