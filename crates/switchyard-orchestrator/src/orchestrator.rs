use crate::router::{CapabilityRouter, TaskEvent};
use crate::task_queue::{schedule_order, TaskArchive};
use crate::types::{Priority, Task, TaskStatus, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchyard_core::{
    spawn_periodic, CancellationToken, CapabilitySet, InboundMessage, IntegrationJob, JobQueue,
    MessageKind, RetryPolicy, SwitchyardError, SwitchyardResult, TaskUpdate,
};
use switchyard_gateway::{ConnectionRegistry, MessageHandler};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Orchestrator tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry budget for tasks created without an explicit one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Timeout for tasks created without an explicit one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Seconds between introspection passes.
    #[serde(default = "default_introspection_interval_secs")]
    pub introspection_interval_secs: u64,
    /// Active task count above which introspection raises an alert.
    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,
    /// Maximum number of finished tasks kept for status queries.
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}
fn default_introspection_interval_secs() -> u64 {
    300
}
fn default_max_active_tasks() -> usize {
    100
}
fn default_archive_capacity() -> usize {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            default_timeout_ms: default_timeout_ms(),
            introspection_interval_secs: default_introspection_interval_secs(),
            max_active_tasks: default_max_active_tasks(),
            archive_capacity: default_archive_capacity(),
        }
    }
}

/// Optional settings for [`TaskOrchestrator::create_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Defaults to 5.
    pub priority: Option<Priority>,
    /// Capabilities a worker needs. Must not be empty.
    pub required_capabilities: CapabilitySet,
    /// Parent task; the new task's depth is the parent's plus one.
    pub parent_task_id: Option<Uuid>,
    /// Retry budget override.
    pub max_retries: Option<u32>,
    /// Timeout override.
    pub timeout_ms: Option<u64>,
}

impl TaskOptions {
    /// Options requiring `caps`, everything else defaulted.
    pub fn requiring(caps: impl Into<CapabilitySet>) -> Self {
        Self {
            required_capabilities: caps.into(),
            ..Self::default()
        }
    }
}

/// Called for every orchestrated task that reaches a terminal state.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    /// `task` is the archived record.
    async fn on_task_finished(&self, task: &Task);
}

/// Output of one introspection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionReport {
    /// When the pass ran.
    pub timestamp: DateTime<Utc>,
    /// Tasks not yet finished.
    pub active: usize,
    /// Finished tasks in the archive.
    pub archived: usize,
    /// Archived tasks that completed.
    pub completed: usize,
    /// Archived tasks that failed.
    pub failed: usize,
    /// Threshold rules that fired.
    pub alerts: Vec<String>,
}

/// Task counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    /// Tasks not yet finished.
    pub active: usize,
    /// Finished tasks in the archive.
    pub archived: usize,
    /// Archived tasks that completed.
    pub completed: usize,
    /// Archived tasks that failed.
    pub failed: usize,
}

/// Archived tasks needed before the failure-rate rule is evaluated.
const FAILURE_RATE_MIN_SAMPLE: usize = 10;

struct OrchestratorState {
    active: HashMap<Uuid, Task>,
    archive: TaskArchive,
    // Active tasks the router may not know about yet.
    submitting: HashSet<Uuid>,
}

/// Owns the lifecycle of higher-level tasks and delegates placement to the
/// [`CapabilityRouter`].
///
/// Router events move tasks from the active set into the orchestrator's
/// archive. A reconcile pass on every introspection catches anything a lagging
/// listener missed.
pub struct TaskOrchestrator {
    router: Arc<CapabilityRouter>,
    registry: Arc<ConnectionRegistry>,
    jobs: Arc<dyn JobQueue>,
    config: OrchestratorConfig,
    state: Mutex<OrchestratorState>,
    hook: RwLock<Option<Arc<dyn CompletionHook>>>,
    last_report: Mutex<Option<IntrospectionReport>>,
    loops: Mutex<Option<(CancellationToken, JoinHandle<()>, JoinHandle<()>)>>,
}

impl TaskOrchestrator {
    /// Creates an orchestrator on top of `router`.
    pub fn new(
        router: Arc<CapabilityRouter>,
        registry: Arc<ConnectionRegistry>,
        jobs: Arc<dyn JobQueue>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let archive = TaskArchive::new(config.archive_capacity);
        Arc::new(Self {
            router,
            registry,
            jobs,
            config,
            state: Mutex::new(OrchestratorState {
                active: HashMap::new(),
                archive,
                submitting: HashSet::new(),
            }),
            hook: RwLock::new(None),
            last_report: Mutex::new(None),
            loops: Mutex::new(None),
        })
    }

    /// Installs the completion hook, replacing any previous one.
    pub fn set_completion_hook(&self, hook: Arc<dyn CompletionHook>) {
        *self.hook.write() = Some(hook);
    }

    /// Installs the `task_result` handler on the registry.
    pub fn attach(self: &Arc<Self>) {
        self.registry.on_message(
            MessageKind::TaskResult,
            Arc::new(ResultHandler {
                orchestrator: Arc::downgrade(self),
            }),
        );
    }

    /// Creates a task and hands it to the router.
    ///
    /// Fails only when `parent_task_id` names an unknown task. A task the
    /// router refuses is archived as failed and its id is still returned.
    pub async fn create_task(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        options: TaskOptions,
    ) -> SwitchyardResult<Uuid> {
        let depth = match options.parent_task_id {
            Some(parent) => {
                let state = self.state.lock();
                let parent_task = state
                    .active
                    .get(&parent)
                    .or_else(|| state.archive.get(parent))
                    .ok_or_else(|| SwitchyardError::Task(format!("Unknown parent task {parent}")))?;
                parent_task.metadata.depth + 1
            }
            None => 0,
        };

        let mut task = Task::new(task_type, payload)
            .with_priority(options.priority.unwrap_or_default())
            .with_capabilities(options.required_capabilities)
            .with_timeout_ms(options.timeout_ms.unwrap_or(self.config.default_timeout_ms));
        task.metadata.parent_id = options.parent_task_id;
        task.metadata.depth = depth;
        task.metadata.max_retries = options.max_retries.unwrap_or(self.config.default_max_retries);

        info!(task_id = %task.id, task_type = %task.task_type, depth, "Creating task");
        Ok(self.submit(task).await)
    }

    /// Resubmits a failed task as a new task with one more retry counted.
    pub async fn retry_task(&self, task_id: Uuid) -> SwitchyardResult<Uuid> {
        let retry = {
            let state = self.state.lock();
            let failed = state
                .archive
                .get(task_id)
                .ok_or_else(|| SwitchyardError::Task(format!("Task {task_id} is not finished")))?;
            if failed.status != TaskStatus::Failed {
                return Err(SwitchyardError::Task(format!(
                    "Task {task_id} did not fail (status {})",
                    failed.status
                )));
            }
            if failed.metadata.retry_count >= failed.metadata.max_retries {
                return Err(SwitchyardError::Task(format!(
                    "Task {task_id} exhausted its retry budget ({})",
                    failed.metadata.max_retries
                )));
            }
            let mut retry = Task::new(failed.task_type.clone(), failed.payload.clone())
                .with_priority(failed.priority)
                .with_capabilities(failed.required_capabilities.clone())
                .with_timeout_ms(failed.metadata.timeout_ms);
            retry.metadata.parent_id = failed.metadata.parent_id;
            retry.metadata.depth = failed.metadata.depth;
            retry.metadata.max_retries = failed.metadata.max_retries;
            retry.metadata.retry_count = failed.metadata.retry_count + 1;
            retry.metadata.retry_of = Some(task_id);
            retry
        };
        info!(
            task_id = %retry.id,
            retry_of = %task_id,
            attempt = retry.metadata.retry_count,
            "Retrying task"
        );
        Ok(self.submit(retry).await)
    }

    async fn submit(&self, task: Task) -> Uuid {
        let id = task.id;
        {
            let mut state = self.state.lock();
            state.active.insert(id, task.clone());
            state.submitting.insert(id);
        }
        let submitted = self.router.submit(task).await;
        self.state.lock().submitting.remove(&id);
        if let Err(e) = submitted {
            warn!(task_id = %id, error = %e, "Task submission failed");
            let failed = {
                let mut state = self.state.lock();
                state.active.remove(&id).map(|mut task| {
                    task.error = Some(e.to_string());
                    task.set_status(TaskStatus::Failed);
                    state.archive.push(task.clone());
                    task
                })
            };
            if let Some(task) = failed {
                self.notify_hook(task).await;
            }
        }
        id
    }

    /// Active-then-archived lookup. Active tasks reflect the router's
    /// current view.
    pub fn get_task_status(&self, task_id: Uuid) -> Option<Task> {
        let recorded = {
            let state = self.state.lock();
            if let Some(task) = state.active.get(&task_id) {
                Some((task.clone(), true))
            } else {
                state.archive.get(task_id).cloned().map(|t| (t, false))
            }
        };
        match recorded {
            Some((task, true)) => Some(self.router.get_status(task_id).unwrap_or(task)),
            Some((task, false)) => Some(task),
            None => None,
        }
    }

    /// Unfinished tasks in scheduling order.
    pub fn list_active(&self) -> Vec<Task> {
        let ids: Vec<Uuid> = self.state.lock().active.keys().copied().collect();
        let mut tasks: Vec<Task> = ids
            .into_iter()
            .filter_map(|id| self.get_task_status(id))
            .collect();
        tasks.sort_by(schedule_order);
        tasks
    }

    /// Task counters.
    pub fn stats(&self) -> OrchestratorStats {
        let state = self.state.lock();
        OrchestratorStats {
            active: state.active.len(),
            archived: state.archive.len(),
            completed: state.archive.count(TaskStatus::Completed),
            failed: state.archive.count(TaskStatus::Failed),
        }
    }

    /// Forwards a worker's result into the router, which releases load and
    /// archives exactly once.
    pub async fn ingest_result(
        &self,
        from: Option<Uuid>,
        update: TaskUpdate,
    ) -> SwitchyardResult<()> {
        debug!(task_id = %update.task_id, status = ?update.status, "Task result received");
        self.router.handle_task_update(from, update).await
    }

    /// Hands an integration step to the job queue.
    pub async fn enqueue_integration_step(
        &self,
        task_id: Uuid,
        step: impl Into<String>,
        run_id: impl Into<String>,
    ) -> SwitchyardResult<()> {
        let job = IntegrationJob {
            task_id,
            step: step.into(),
            run_id: run_id.into(),
            retry: RetryPolicy {
                max_retries: self.config.default_max_retries,
                ..RetryPolicy::default()
            },
        };
        let step = job.step.clone();
        self.jobs.enqueue(job).await.map_err(|e| {
            warn!(
                task_id = %task_id,
                step = %step,
                error = %e,
                "Failed to enqueue integration step",
            );
            e
        })
    }

    // --- Introspection ---

    /// Reconciles against the router, evaluates alert rules and stores the
    /// report.
    pub async fn introspect(&self) -> IntrospectionReport {
        self.reconcile().await;
        let stats = self.stats();
        let mut alerts = Vec::new();
        if stats.active > self.config.max_active_tasks {
            alerts.push(format!(
                "Too many active tasks: {} (limit {})",
                stats.active, self.config.max_active_tasks
            ));
        }
        if stats.archived >= FAILURE_RATE_MIN_SAMPLE && stats.failed * 2 > stats.archived {
            alerts.push(format!(
                "High failure rate: {} of {} archived tasks failed",
                stats.failed, stats.archived
            ));
        }
        for alert in &alerts {
            warn!(alert = %alert, "Introspection alert");
        }
        let report = IntrospectionReport {
            timestamp: Utc::now(),
            active: stats.active,
            archived: stats.archived,
            completed: stats.completed,
            failed: stats.failed,
            alerts,
        };
        info!(
            active = report.active,
            archived = report.archived,
            failed = report.failed,
            "Introspection complete"
        );
        *self.last_report.lock() = Some(report.clone());
        report
    }

    /// The most recent introspection report.
    pub fn last_report(&self) -> Option<IntrospectionReport> {
        self.last_report.lock().clone()
    }

    /// Archives active tasks the router already finished, and fails tasks the
    /// router no longer tracks. Runs the completion hook for each one moved.
    async fn reconcile(&self) -> usize {
        let ids: Vec<Uuid> = {
            let state = self.state.lock();
            state
                .active
                .keys()
                .filter(|id| !state.submitting.contains(id))
                .copied()
                .collect()
        };
        let finished: Vec<(Uuid, Option<Task>)> = ids
            .into_iter()
            .filter_map(|id| match self.router.get_status(id) {
                Some(task) if task.status.is_terminal() => Some((id, Some(task))),
                Some(_) => None,
                None => Some((id, None)),
            })
            .collect();

        let moved: Vec<Task> = {
            let mut state = self.state.lock();
            let mut moved = Vec::new();
            for (id, routed) in finished {
                let Some(recorded) = state.active.remove(&id) else {
                    continue;
                };
                let task = routed.unwrap_or_else(|| {
                    warn!(task_id = %id, "Task no longer tracked by the router, marking failed");
                    let mut lost = recorded;
                    lost.error = Some("Task no longer tracked by the router".to_string());
                    lost.set_status(TaskStatus::Failed);
                    lost
                });
                debug!(task_id = %id, status = %task.status, "Reconciled finished task");
                state.archive.push(task.clone());
                moved.push(task);
            }
            moved
        };

        let count = moved.len();
        for task in moved {
            self.notify_hook(task).await;
        }
        count
    }

    // --- Background loops ---

    /// Starts the router event listener and the introspection loop.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let listener = self.spawn_listener(shutdown.clone());
        let orchestrator = Arc::clone(self);
        let introspection = spawn_periodic(
            "orchestrator-introspection",
            Duration::from_secs(self.config.introspection_interval_secs),
            shutdown.clone(),
            move || {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    orchestrator.introspect().await;
                }
            },
        );
        if let Some((_, old_listener, old_introspection)) =
            self.loops.lock().replace((shutdown, listener, introspection))
        {
            old_listener.abort();
            old_introspection.abort();
        }
    }

    /// Returns `true` while the event listener is alive.
    pub fn is_listening(&self) -> bool {
        self.loops
            .lock()
            .as_ref()
            .is_some_and(|(_, listener, _)| !listener.is_finished())
    }

    /// Restarts dead loops and reconciles with the router.
    pub async fn reinitialize(self: &Arc<Self>) -> SwitchyardResult<()> {
        let token = self.loops.lock().as_ref().map(|(t, _, _)| t.clone());
        if let Some(token) = token {
            if !self.is_listening() && !token.is_cancelled() {
                info!("Restarting orchestrator listener");
                self.start(token);
            }
        }
        let moved = self.reconcile().await;
        info!(reconciled = moved, "Orchestrator reinitialized");
        Ok(())
    }

    fn spawn_listener(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self.router.subscribe();
        let orchestrator = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(this) = orchestrator.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => this.apply_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Orchestrator lagged behind task events");
                        this.reconcile().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn apply_event(&self, event: TaskEvent) {
        match event {
            TaskEvent::Assigned { task_id, worker_id } => {
                if let Some(task) = self.state.lock().active.get_mut(&task_id) {
                    task.assigned_worker = Some(worker_id);
                    task.set_status(TaskStatus::Assigned);
                }
            }
            TaskEvent::Started { task_id } => {
                if let Some(task) = self.state.lock().active.get_mut(&task_id) {
                    task.set_status(TaskStatus::InProgress);
                }
            }
            TaskEvent::Finished(task) => {
                let ours = {
                    let mut state = self.state.lock();
                    if state.active.remove(&task.id).is_some() {
                        state.archive.push(task.clone());
                        true
                    } else {
                        false
                    }
                };
                if ours {
                    self.notify_hook(task).await;
                }
            }
        }
    }

    async fn notify_hook(&self, task: Task) {
        let hook = self.hook.read().clone();
        let Some(hook) = hook else {
            return;
        };
        let task_id = task.id;
        let outcome = tokio::spawn(async move { hook.on_task_finished(&task).await }).await;
        if let Err(e) = outcome {
            error!(task_id = %task_id, error = %e, "Completion hook panicked");
        }
    }
}

struct ResultHandler {
    orchestrator: Weak<TaskOrchestrator>,
}

#[async_trait]
impl MessageHandler for ResultHandler {
    async fn handle(&self, connection_id: Uuid, message: InboundMessage) -> SwitchyardResult<()> {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Err(SwitchyardError::Task("Orchestrator is shut down".into()));
        };
        match message {
            InboundMessage::TaskResult(update) => {
                orchestrator.ingest_result(Some(connection_id), update).await
            }
            other => Err(SwitchyardError::Protocol(format!(
                "Orchestrator cannot handle '{}'",
                other.kind()
            ))),
        }
    }
}
