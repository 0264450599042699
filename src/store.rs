//! Seams to the external collaborators: the action metadata store, the
//! activation result sink, and the log forwarder. The invoker only ever
//! talks to these traits; deployments plug in their own backends.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::objects::{ActionDescriptor, ActionRef, ActivationRecord, LogLine};

/// Key -> action-code+limits lookup.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// `Ok(None)` means the action does not exist at that revision.
    async fn get_action(
        &self,
        namespace: &str,
        name: &str,
        revision: &str,
    ) -> anyhow::Result<Option<ActionDescriptor>>;
}

/// Write-only sink for completed activation records.
#[async_trait]
pub trait ActivationSink: Send + Sync {
    async fn record(&self, record: &ActivationRecord) -> anyhow::Result<()>;
}

/// Write-only sink for activation log lines.
#[async_trait]
pub trait LogForwarder: Send + Sync {
    /// Forward the lines for one activation; returns a reference usable as
    /// `logs_ref` in the record, if the backend produces one.
    async fn forward(
        &self,
        activation_id: &str,
        lines: &[LogLine],
    ) -> anyhow::Result<Option<String>>;
}

/// In-memory action store, for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryActionStore {
    actions: Mutex<HashMap<ActionRef, ActionDescriptor>>,
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, action: ActionDescriptor) {
        self.actions
            .lock()
            .await
            .insert(action.action.clone(), action);
    }
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn get_action(
        &self,
        namespace: &str,
        name: &str,
        revision: &str,
    ) -> anyhow::Result<Option<ActionDescriptor>> {
        let key = ActionRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            revision: revision.to_string(),
        };
        Ok(self.actions.lock().await.get(&key).cloned())
    }
}

/// In-memory activation sink retaining every record, newest last.
#[derive(Default)]
pub struct MemoryActivationSink {
    records: Mutex<Vec<ActivationRecord>>,
}

impl MemoryActivationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ActivationRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ActivationSink for MemoryActivationSink {
    async fn record(&self, record: &ActivationRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// In-memory log forwarder keyed by activation id.
#[derive(Default)]
pub struct MemoryLogForwarder {
    logs: Mutex<HashMap<String, Vec<LogLine>>>,
}

impl MemoryLogForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lines(&self, activation_id: &str) -> Vec<LogLine> {
        self.logs
            .lock()
            .await
            .get(activation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogForwarder for MemoryLogForwarder {
    async fn forward(
        &self,
        activation_id: &str,
        lines: &[LogLine],
    ) -> anyhow::Result<Option<String>> {
        self.logs
            .lock()
            .await
            .entry(activation_id.to_string())
            .or_default()
            .extend_from_slice(lines);
        Ok(Some(format!("memory:{}", activation_id)))
    }
}

/// Bundle of sink handles threaded through the pool and runner.
#[derive(Clone)]
pub struct Sinks {
    pub results: Arc<dyn ActivationSink>,
    pub logs: Arc<dyn LogForwarder>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::CodePayload;

    fn sample_action() -> ActionDescriptor {
        ActionDescriptor {
            action: ActionRef {
                namespace: "guest".to_string(),
                name: "echo".to_string(),
                revision: "1".to_string(),
            },
            code: CodePayload::default(),
            kind: "nodejs:14".to_string(),
            memory_mb: 256,
            time_limit_s: 60,
            concurrent_limit: 1,
        }
    }

    #[tokio::test]
    async fn test_memory_action_store_lookup() {
        let store = MemoryActionStore::new();
        store.put(sample_action()).await;

        let found = store.get_action("guest", "echo", "1").await.unwrap();
        assert!(found.is_some());

        let missing = store.get_action("guest", "echo", "2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_memory_log_forwarder_accumulates() {
        let forwarder = MemoryLogForwarder::new();
        let line = LogLine {
            time: chrono::Utc::now(),
            stream: crate::objects::LogStream::Stdout,
            log: "hello".to_string(),
        };
        let log_ref = forwarder.forward("a1", &[line.clone()]).await.unwrap();
        assert_eq!(log_ref.as_deref(), Some("memory:a1"));
        forwarder.forward("a1", &[line]).await.unwrap();
        assert_eq!(forwarder.lines("a1").await.len(), 2);
    }
}
