//! Capability routing and task lifecycle orchestration.
//!
//! The [`CapabilityRouter`] places tasks on the least-loaded worker whose
//! capabilities cover the task's requirements, enforces per-task timeouts and
//! releases load when tasks finish. The [`TaskOrchestrator`] sits on top: it
//! creates tasks with hierarchy and retry bookkeeping, ingests results and
//! runs periodic introspection.
//!
//! # Main types
//!
//! - [`CapabilityRouter`]: Placement, heartbeats, timeouts and the task archive.
//! - [`TaskOrchestrator`]: Task creation, result ingestion, retries and introspection.
//! - [`TaskQueue`]: Active tasks in priority-then-age order.
//! - [`Task`] / [`WorkerStatus`]: Shared records.

/// Task creation, result ingestion and introspection.
pub mod orchestrator;
/// Capability-based placement.
pub mod router;
/// Active task queue and bounded archive.
pub mod task_queue;
/// Shared orchestration types (Task, WorkerStatus, Priority, etc.).
pub mod types;

pub use orchestrator::{
    CompletionHook, IntrospectionReport, OrchestratorConfig, OrchestratorStats, TaskOptions,
    TaskOrchestrator,
};
pub use router::{CapabilityRouter, RouterConfig, RouterStats, TaskEvent};
pub use task_queue::{TaskArchive, TaskQueue};
pub use types::{Priority, Task, TaskMetadata, TaskStatus, WorkerStatus};
