//! Serverless function invoker library.
//!
//! Exposes the container pool and its collaborators for embedding and
//! testing; the `invokerd` binary wires them to a real sandbox runtime.

pub mod config;
pub mod driver;
pub mod error;
pub mod feed;
pub mod http_client;
pub mod metrics;
pub mod objects;
pub mod pool;
pub mod retry;
pub mod runner;
pub mod service;
pub mod store;
pub mod tracing;

// Re-export key types for convenience
pub use config::InvokerConfig;
pub use driver::{ContainerHandle, ContainerSpec, DriverError, RunError, RunOutcome, SandboxDriver};
pub use error::ActivationError;
pub use feed::{ChannelMessageSource, Delivery, MessageSource, WorkFeed};
pub use metrics::InvokerMetrics;
pub use objects::{
    ActionDescriptor, ActionRef, ActivationRecord, ActivationStatus, InvocationMessage, WorkItem,
};
pub use pool::{ContainerPool, PoolContext, PoolHandle};
pub use service::{Service, ServiceError};
pub use store::{
    ActionStore, ActivationSink, LogForwarder, MemoryActionStore, MemoryActivationSink,
    MemoryLogForwarder, Sinks,
};
