//! Shared test fixtures: a scripted mock sandbox driver and config/action
//! builders.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use invokerd::{
    ContainerHandle, ContainerSpec, DriverError, InvokerConfig, InvokerMetrics, RunOutcome,
    SandboxDriver,
    config::{DriverConfig, PrewarmSpec, TelemetryConfig},
    driver::{LOG_SENTINEL, RunError},
    objects::{
        ActionDescriptor, ActionRef, CodePayload, InvocationMessage, LogLine, LogStream, WorkItem,
        now_ms,
    },
    pool::{ContainerPool, PoolContext, PoolHandle},
    store::{MemoryActivationSink, MemoryLogForwarder, Sinks},
};
use tokio::sync::Mutex;

/// Mock sandbox driver. Run behavior is scripted through the activation
/// arguments: `behavior` selects the response shape and `delay_ms` how long
/// the handler pretends to work.
pub struct MockDriver {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub inits: AtomicUsize,
    pub resumes: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_pause: AtomicBool,
    live: Mutex<HashMap<String, u64>>,
    paused: Mutex<HashSet<String>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_pause: AtomicBool::new(false),
            live: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashSet::new()),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    /// Sum of the memory of every container currently alive in the
    /// sandbox runtime.
    pub async fn live_memory_mb(&self) -> u64 {
        self.live.lock().await.values().sum()
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    pub async fn paused_count(&self) -> usize {
        self.paused.lock().await.len()
    }
}

#[async_trait]
impl SandboxDriver for MockDriver {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, DriverError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(DriverError::Create("scripted create failure".to_string()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live
            .lock()
            .await
            .insert(spec.name.clone(), spec.memory_mb);
        Ok(ContainerHandle {
            id: spec.name,
            address: "127.0.0.1:0".to_string(),
            kind: spec.kind,
            memory_mb: spec.memory_mb,
        })
    }

    async fn init(
        &self,
        _handle: &ContainerHandle,
        payload: &CodePayload,
    ) -> Result<(), DriverError> {
        if payload.code == "FAIL_INIT" {
            return Err(DriverError::Init {
                diagnostic: "scripted init failure".to_string(),
            });
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(
        &self,
        _handle: &ContainerHandle,
        args: &serde_json::Value,
        deadline: Duration,
    ) -> Result<RunOutcome, DriverError> {
        let behavior = args
            .get("behavior")
            .and_then(|b| b.as_str())
            .unwrap_or("ok");
        let delay = Duration::from_millis(
            args.get("delay_ms").and_then(|d| d.as_u64()).unwrap_or(0),
        );

        if delay >= deadline {
            tokio::time::sleep(deadline).await;
            return Err(RunError::Timeout(deadline).into());
        }
        tokio::time::sleep(delay).await;

        let outcome = match behavior {
            "app_error" => RunOutcome {
                status_code: 200,
                body: r#"{"error":"boom"}"#.to_string(),
                truncated: false,
            },
            "bad_gateway" => RunOutcome {
                status_code: 502,
                body: r#"{"error":"The action failed to locate a binary."}"#.to_string(),
                truncated: false,
            },
            "not_dict" => RunOutcome {
                status_code: 200,
                body: "42".to_string(),
                truncated: false,
            },
            "connection" => return Err(RunError::Connection("reset by peer".to_string()).into()),
            _ => RunOutcome {
                status_code: 200,
                body: r#"{"payload":"done"}"#.to_string(),
                truncated: false,
            },
        };
        Ok(outcome)
    }

    async fn pause(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(DriverError::Other("scripted pause failure".to_string()));
        }
        self.paused.lock().await.insert(handle.id.clone());
        Ok(())
    }

    async fn resume(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        self.paused.lock().await.remove(&handle.id);
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        let removed = self.live.lock().await.remove(&handle.id);
        if removed.is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        self.paused.lock().await.remove(&handle.id);
        Ok(())
    }

    async fn logs(
        &self,
        _handle: &ContainerHandle,
        _since: DateTime<Utc>,
    ) -> Result<Vec<LogLine>, DriverError> {
        let now = Utc::now();
        Ok(vec![
            LogLine {
                time: now,
                stream: LogStream::Stdout,
                log: "hello from action".to_string(),
            },
            LogLine {
                time: now,
                stream: LogStream::Stdout,
                log: LOG_SENTINEL.to_string(),
            },
            LogLine {
                time: now,
                stream: LogStream::Stderr,
                log: LOG_SENTINEL.to_string(),
            },
        ])
    }
}

pub fn test_config(memory_limit_mb: u64, prewarm: Vec<PrewarmSpec>) -> InvokerConfig {
    let mut runtimes = HashMap::new();
    runtimes.insert("nodejs:14".to_string(), "mock/nodejs:14".to_string());
    runtimes.insert("python:3".to_string(), "mock/python:3".to_string());
    InvokerConfig {
        env: "local".to_string(),
        invoker_id: "invoker-test".to_string(),
        memory_limit_mb,
        prewarm,
        idle_grace_ms: 60_000,
        eviction_lru: true,
        concurrent_peek: 16,
        namespace_concurrency_default: 8,
        pause_failure_fatal: false,
        log_collect_timeout_ms: 500,
        max_response_bytes: 1_048_576,
        shutdown_grace_ms: 2_000,
        submit_max_retries: 2,
        submit_backoff_initial_ms: 20,
        submit_backoff_max_ms: 100,
        runtimes,
        driver: DriverConfig::Docker,
        telemetry: TelemetryConfig::default(),
    }
}

pub struct Harness {
    pub driver: Arc<MockDriver>,
    pub pool: PoolHandle,
    pub results: Arc<MemoryActivationSink>,
    pub logs: Arc<MemoryLogForwarder>,
}

pub fn start_pool(config: InvokerConfig) -> Harness {
    let driver = MockDriver::new();
    let results = Arc::new(MemoryActivationSink::new());
    let logs = Arc::new(MemoryLogForwarder::new());
    let ctx = PoolContext {
        driver: driver.clone(),
        metrics: Arc::new(InvokerMetrics::new()),
        sinks: Sinks {
            results: results.clone(),
            logs: logs.clone(),
        },
        config: Arc::new(config),
    };
    let (pool, _join) = ContainerPool::spawn(ctx);
    Harness {
        driver,
        pool,
        results,
        logs,
    }
}

pub fn action(name: &str, memory_mb: u64, time_limit_s: u64, concurrent_limit: u32) -> ActionDescriptor {
    ActionDescriptor {
        action: ActionRef {
            namespace: "guest".to_string(),
            name: name.to_string(),
            revision: "1".to_string(),
        },
        code: CodePayload {
            code: "function main(args) { return args; }".to_string(),
            binary: false,
            main: "main".to_string(),
            env: HashMap::new(),
        },
        kind: "nodejs:14".to_string(),
        memory_mb,
        time_limit_s,
        concurrent_limit,
    }
}

pub fn work_item(action: &ActionDescriptor, activation_id: &str, args: serde_json::Value) -> WorkItem {
    WorkItem {
        message: InvocationMessage {
            activation_id: activation_id.to_string(),
            namespace: action.action.namespace.clone(),
            action: action.action.name.clone(),
            revision: action.action.revision.clone(),
            args,
            transid: format!("tid-{}", activation_id),
            deadline_ms: now_ms() + 60_000,
        },
        action: action.clone(),
        enqueued_at: Instant::now(),
    }
}

/// Poll `check` until it holds or `timeout` elapses; panics on timeout.
pub async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("condition never held: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
