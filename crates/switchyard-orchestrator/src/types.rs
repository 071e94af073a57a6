use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use switchyard_core::{CapabilitySet, TaskAssignment};
use tokio::time::Instant;
use uuid::Uuid;

/// Default number of retries a caller may request for a failed task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default time a task may stay unfinished before it is failed.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Scheduling weight added to a worker per assigned task.
///
/// The unit is opaque: 10 assigned tasks saturate a worker that reported
/// zero load.
pub const LOAD_UNIT: u8 = 10;

/// Load at which a worker stops receiving work.
pub const MAX_LOAD: u8 = 100;

/// Task urgency, clamped to `0..=10`. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority.
    pub const MIN: Priority = Priority(0);
    /// Highest priority.
    pub const MAX: Priority = Priority(10);

    /// Creates a priority, clamping out-of-range values.
    pub fn new(value: u8) -> Self {
        Priority(value.min(Self::MAX.0))
    }

    /// Numeric value.
    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a qualifying worker.
    Pending,
    /// Dispatched to a worker.
    Assigned,
    /// Worker reported it started.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error, timed out, or could not be dispatched.
    Failed,
}

impl TaskStatus {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Bookkeeping carried by every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Parent task, if this task was spawned by another.
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    /// Depth in the task hierarchy (0 = root task).
    #[serde(default)]
    pub depth: u32,
    /// How many times this task has been retried.
    #[serde(default)]
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Deadline measured from submission.
    pub timeout_ms: u64,
    /// Task this one retries, if any.
    #[serde(default)]
    pub retry_of: Option<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            parent_id: None,
            depth: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_of: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A unit of work routed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique id.
    pub id: Uuid,
    /// Type tag interpreted by the worker.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Urgency.
    pub priority: Priority,
    /// Capabilities a worker must have to take this task.
    pub required_capabilities: CapabilitySet,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Worker holding the task.
    #[serde(default)]
    pub assigned_worker: Option<Uuid>,
    /// Result of a completed task.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error of a failed task.
    #[serde(default)]
    pub error: Option<String>,
    /// Bookkeeping.
    pub metadata: TaskMetadata,
    /// Submission order, used as the final scheduling tie-break.
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl Task {
    /// Creates a pending task with default priority, retry budget and timeout.
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            priority: Priority::default(),
            required_capabilities: CapabilitySet::new(),
            payload,
            status: TaskStatus::Pending,
            assigned_worker: None,
            result: None,
            error: None,
            metadata: TaskMetadata::default(),
            sequence: 0,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Sets the required capabilities.
    pub fn with_capabilities(mut self, caps: impl Into<CapabilitySet>) -> Self {
        self.required_capabilities = caps.into();
        self
    }

    /// Sets the timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.metadata.timeout_ms = timeout_ms;
        self
    }

    /// Updates status and the `updated_at` stamp.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.metadata.updated_at = Utc::now();
    }

    /// Builds the dispatch message for this task.
    pub fn assignment(&self) -> TaskAssignment {
        TaskAssignment {
            task_id: self.id,
            task_type: self.task_type.clone(),
            priority: self.priority.value(),
            payload: self.payload.clone(),
            required_capabilities: self.required_capabilities.clone(),
        }
    }
}

/// A capability-bearing connection as seen by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Connection id of the worker.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Declared capabilities.
    pub capabilities: CapabilitySet,
    /// Current load, 0-100.
    pub load: u8,
    /// Self-reported availability.
    pub available: bool,
    /// Last heartbeat or registration.
    pub last_heartbeat: DateTime<Utc>,
    /// Metadata from the latest heartbeat.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(skip, default = "Instant::now")]
    pub(crate) last_seen: Instant,
}

impl WorkerStatus {
    /// Creates an idle, available worker.
    pub fn new(id: Uuid, name: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities,
            load: 0,
            available: true,
            last_heartbeat: Utc::now(),
            metadata: HashMap::new(),
            last_seen: Instant::now(),
        }
    }

    /// A worker can take work when it says so and has headroom.
    pub fn is_available(&self) -> bool {
        self.available && self.load < MAX_LOAD
    }

    /// Returns `true` if this worker can take `task` right now.
    pub fn can_take(&self, task: &Task) -> bool {
        self.is_available() && self.capabilities.is_superset_of(&task.required_capabilities)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchyard_core::Capability;

    #[test]
    fn test_task_creation_defaults() {
        let task = Task::new("build", serde_json::json!({}));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::new(5));
        assert_eq!(task.metadata.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.metadata.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(task.metadata.depth, 0);
        assert!(task.required_capabilities.is_empty());
    }

    #[test]
    fn test_priority_clamps() {
        assert_eq!(Priority::new(42), Priority::MAX);
        let parsed: Priority = serde_json::from_str("250").unwrap();
        assert_eq!(parsed.value(), 10);
    }

    #[test]
    fn test_worker_saturation_makes_unavailable() {
        let caps = CapabilitySet::from([Capability::Code]);
        let mut worker = WorkerStatus::new(Uuid::new_v4(), "w", caps);
        assert!(worker.is_available());
        worker.load = 100;
        assert!(!worker.is_available());
        worker.load = 0;
        worker.available = false;
        assert!(!worker.is_available());
    }

    #[test]
    fn test_can_take_requires_superset() {
        let worker = WorkerStatus::new(
            Uuid::new_v4(),
            "w",
            CapabilitySet::from([Capability::Code, Capability::Test]),
        );
        let ok = Task::new("t", serde_json::Value::Null).with_capabilities([Capability::Test]);
        let no = Task::new("t", serde_json::Value::Null)
            .with_capabilities([Capability::Test, Capability::Deploy]);
        assert!(worker.can_take(&ok));
        assert!(!worker.can_take(&no));
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
    }

    #[test]
    fn test_task_wire_shape() {
        let task = Task::new("deploy", serde_json::json!({"env": "prod"})).with_priority(8);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "deploy");
        assert_eq!(json["priority"], 8);
        assert_eq!(json["metadata"]["maxRetries"], 3);
        assert!(json.get("sequence").is_none());
    }
}
