use crate::task_queue::{TaskArchive, TaskQueue};
use crate::types::{Task, TaskStatus, WorkerStatus, LOAD_UNIT, MAX_LOAD};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchyard_core::{
    spawn_periodic, CancellationToken, CapabilitySet, Heartbeat, InboundMessage, MessageKind,
    OutboundMessage, ReportedStatus, SwitchyardError, SwitchyardResult, TaskUpdate,
};
use switchyard_gateway::{ConnectionEvent, ConnectionRegistry, MessageHandler};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Router tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Seconds between scheduling ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Timeout applied to tasks that carry `timeout_ms = 0`.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Maximum number of archived tasks kept for status queries.
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
    /// Seconds without a heartbeat after which a worker stops receiving work.
    #[serde(default = "default_worker_stale_secs")]
    pub worker_stale_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    5
}
fn default_task_timeout_ms() -> u64 {
    crate::types::DEFAULT_TIMEOUT_MS
}
fn default_archive_capacity() -> usize {
    1000
}
fn default_worker_stale_secs() -> u64 {
    90
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            task_timeout_ms: default_task_timeout_ms(),
            archive_capacity: default_archive_capacity(),
            worker_stale_secs: default_worker_stale_secs(),
        }
    }
}

/// Task lifecycle notifications published by the router.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was dispatched to a worker.
    Assigned {
        /// Task id.
        task_id: Uuid,
        /// Worker (connection) id.
        worker_id: Uuid,
    },
    /// The worker reported it started the task.
    Started {
        /// Task id.
        task_id: Uuid,
    },
    /// The task reached a terminal state and was archived.
    Finished(Task),
}

/// Counters for introspection and health probes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    /// Tasks waiting for a worker.
    pub pending: usize,
    /// Tasks dispatched but not started.
    pub assigned: usize,
    /// Tasks reported started.
    pub in_progress: usize,
    /// Tasks in the archive.
    pub archived: usize,
    /// Registered workers.
    pub workers: usize,
    /// Workers that can take work now.
    pub available_workers: usize,
}

struct RouterState {
    workers: HashMap<Uuid, WorkerStatus>,
    queue: TaskQueue,
    archive: TaskArchive,
    timers: HashMap<Uuid, AbortHandle>,
}

enum UpdateOutcome {
    Late,
    Unknown,
    Started,
    Finished(Option<Task>),
}

/// Places tasks on the least-loaded worker whose capabilities cover the
/// task's requirements.
///
/// Workers, active tasks, the archive and timeout timers live in one
/// `RouterState` behind a single mutex. Every operation takes the lock once,
/// mutates, releases, and only then talks to the registry, so placement
/// decisions are atomic and no lock is held across an await.
pub struct CapabilityRouter {
    state: Mutex<RouterState>,
    registry: Arc<ConnectionRegistry>,
    events: broadcast::Sender<TaskEvent>,
    config: RouterConfig,
    last_tick: Mutex<Option<Instant>>,
    loops: Mutex<Option<(CancellationToken, JoinHandle<()>, JoinHandle<()>)>>,
    me: Weak<CapabilityRouter>,
}

impl CapabilityRouter {
    /// Creates a router that dispatches through `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, config: RouterConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(RouterState {
                workers: HashMap::new(),
                queue: TaskQueue::new(),
                archive: TaskArchive::new(config.archive_capacity),
                timers: HashMap::new(),
            }),
            registry,
            events,
            config,
            last_tick: Mutex::new(None),
            loops: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Subscribes to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Installs the router's message handlers on the registry.
    pub fn attach(self: &Arc<Self>) {
        let handler: Arc<dyn MessageHandler> = Arc::new(RouterHandler {
            router: Arc::downgrade(self),
        });
        for kind in [
            MessageKind::BotHeartbeat,
            MessageKind::ServiceStatus,
            MessageKind::WorkerRegister,
            MessageKind::TaskUpdate,
        ] {
            self.registry.on_message(kind, handler.clone());
        }
    }

    // --- Workers ---

    /// Adds or replaces a worker with zero load.
    pub async fn register_worker(
        &self,
        id: Uuid,
        name: impl Into<String>,
        capabilities: CapabilitySet,
    ) {
        let name = name.into();
        info!(worker_id = %id, name = %name, capabilities = %capabilities, "Worker registered");
        self.state
            .lock()
            .workers
            .insert(id, WorkerStatus::new(id, name, capabilities));
        self.schedule().await;
    }

    /// Removes a worker and returns the tasks it held to the pending queue.
    pub async fn remove_worker(&self, id: Uuid) {
        let requeued = {
            let mut state = self.state.lock();
            if state.workers.remove(&id).is_none() {
                return;
            }
            let held = state.queue.held_by(id);
            for task_id in &held {
                if let Some(task) = state.queue.get_mut(*task_id) {
                    task.assigned_worker = None;
                    task.set_status(TaskStatus::Pending);
                }
            }
            held.len()
        };
        info!(worker_id = %id, requeued, "Worker removed");
        self.schedule().await;
    }

    /// Applies a self-reported heartbeat. Unknown senders that include a
    /// name and capabilities are registered on the fly.
    pub async fn handle_heartbeat(&self, worker_id: Uuid, heartbeat: Heartbeat) {
        let became_available = {
            let mut state = self.state.lock();
            if !state.workers.contains_key(&worker_id) {
                match (&heartbeat.name, &heartbeat.capabilities) {
                    (Some(name), Some(caps)) => {
                        info!(
                            worker_id = %worker_id,
                            name = %name,
                            "Worker registered from heartbeat",
                        );
                        let status = WorkerStatus::new(worker_id, name.clone(), caps.clone());
                        state.workers.insert(worker_id, status);
                    }
                    _ => {
                        debug!(
                            worker_id = %worker_id,
                            "Heartbeat from unregistered worker ignored",
                        );
                        return;
                    }
                }
            }
            let Some(worker) = state.workers.get_mut(&worker_id) else {
                return;
            };
            let was_available = worker.is_available();
            if let Some(load) = heartbeat.load {
                worker.load = load.clamp(0.0, f64::from(MAX_LOAD)).round() as u8;
            }
            worker.available = heartbeat.available.unwrap_or(true);
            if let Some(name) = heartbeat.name {
                worker.name = name;
            }
            if let Some(caps) = heartbeat.capabilities {
                worker.capabilities = caps;
            }
            worker.metadata.extend(heartbeat.metadata);
            worker.last_heartbeat = Utc::now();
            worker.last_seen = Instant::now();
            !was_available && worker.is_available()
        };
        if became_available {
            debug!(worker_id = %worker_id, "Worker became available");
        }
        self.schedule().await;
    }

    /// Snapshot of all workers, sorted by name.
    pub fn workers(&self) -> Vec<WorkerStatus> {
        let mut workers: Vec<WorkerStatus> = self.state.lock().workers.values().cloned().collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        workers
    }

    /// One worker's status.
    pub fn worker(&self, id: Uuid) -> Option<WorkerStatus> {
        self.state.lock().workers.get(&id).cloned()
    }

    // --- Tasks ---

    /// Queues a task and immediately attempts placement.
    ///
    /// Tasks with no required capabilities are rejected as unroutable. The
    /// task's timeout starts now and covers both waiting and execution.
    pub async fn submit(&self, mut task: Task) -> SwitchyardResult<Uuid> {
        if task.required_capabilities.is_empty() {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                "Rejecting unroutable task: no required capabilities",
            );
            return Err(SwitchyardError::Routing(format!(
                "Task {} declares no required capabilities",
                task.id
            )));
        }

        let id = task.id;
        let timeout = self.timeout_for(&task);
        task.assigned_worker = None;
        task.set_status(TaskStatus::Pending);
        {
            let mut state = self.state.lock();
            if !state.queue.add(task) {
                return Err(SwitchyardError::Routing(format!("Task {id} is already queued")));
            }
            let timer = self.spawn_timeout(id, timeout);
            state.timers.insert(id, timer);
        }
        info!(task_id = %id, timeout_ms = timeout.as_millis() as u64, "Task queued");

        self.schedule().await;
        Ok(id)
    }

    /// Looks a task up among active, then archived tasks.
    pub fn get_status(&self, task_id: Uuid) -> Option<Task> {
        let state = self.state.lock();
        state
            .queue
            .get(task_id)
            .or_else(|| state.archive.get(task_id))
            .cloned()
    }

    /// Applies a status report. `from` is the reporting connection; when
    /// present it must be the worker holding the task.
    ///
    /// Reports for archived tasks are logged and discarded: a task that has
    /// timed out stays failed.
    pub async fn handle_task_update(
        &self,
        from: Option<Uuid>,
        update: TaskUpdate,
    ) -> SwitchyardResult<()> {
        let id = update.task_id;
        let outcome = {
            let mut state = self.state.lock();
            match state.queue.get(id) {
                None if state.archive.contains(id) => UpdateOutcome::Late,
                None => UpdateOutcome::Unknown,
                Some(task) => {
                    if let Some(from) = from {
                        if task.assigned_worker != Some(from) {
                            return Err(SwitchyardError::Routing(format!(
                                "Connection {from} does not hold task {id}"
                            )));
                        }
                    }
                    if task.status == TaskStatus::Pending {
                        return Err(SwitchyardError::Task(format!("Task {id} is not assigned")));
                    }
                    match update.status {
                        ReportedStatus::InProgress => {
                            if let Some(task) = state.queue.get_mut(id) {
                                task.set_status(TaskStatus::InProgress);
                            }
                            UpdateOutcome::Started
                        }
                        ReportedStatus::Completed => UpdateOutcome::Finished(finish_locked(
                            &mut state,
                            id,
                            TaskStatus::Completed,
                            update.result,
                            None,
                        )),
                        ReportedStatus::Failed => {
                            let error = update
                                .error
                                .unwrap_or_else(|| "Worker reported failure".to_string());
                            UpdateOutcome::Finished(finish_locked(
                                &mut state,
                                id,
                                TaskStatus::Failed,
                                update.result,
                                Some(error),
                            ))
                        }
                    }
                }
            }
        };

        match outcome {
            UpdateOutcome::Late => {
                warn!(
                    task_id = %id,
                    status = ?update.status,
                    "Late update for archived task discarded",
                );
            }
            UpdateOutcome::Unknown => {
                warn!(task_id = %id, "Update for unknown task discarded");
            }
            UpdateOutcome::Started => {
                debug!(task_id = %id, "Task in progress");
                let _ = self.events.send(TaskEvent::Started { task_id: id });
            }
            UpdateOutcome::Finished(task) => {
                if let Some(task) = task {
                    self.publish_finished(task);
                }
                self.schedule().await;
            }
        }
        Ok(())
    }

    /// Runs one placement pass. Returns the number of tasks dispatched.
    pub async fn schedule(&self) -> usize {
        let placements = {
            let mut state = self.state.lock();
            let RouterState { workers, queue, .. } = &mut *state;
            let mut placements = Vec::new();
            for task_id in queue.pending_in_order() {
                let Some(task) = queue.get_mut(task_id) else {
                    continue;
                };
                let best = workers
                    .values_mut()
                    .filter(|w| w.can_take(task))
                    .min_by_key(|w| (w.load, w.id));
                let Some(worker) = best else {
                    continue;
                };
                // Uncapped so the release on finish mirrors this increment.
                worker.load = worker.load.saturating_add(LOAD_UNIT);
                task.assigned_worker = Some(worker.id);
                task.set_status(TaskStatus::Assigned);
                placements.push((task_id, worker.id, task.assignment()));
            }
            placements
        };

        let mut dispatched = 0;
        for (task_id, worker_id, assignment) in placements {
            let delivered = self
                .registry
                .send(worker_id, &OutboundMessage::TaskAssignment(assignment))
                .await;
            if delivered {
                info!(task_id = %task_id, worker_id = %worker_id, "Task assigned");
                let _ = self.events.send(TaskEvent::Assigned { task_id, worker_id });
                dispatched += 1;
            } else {
                let error = format!("Dispatch to worker {worker_id} failed");
                let task = finish_locked(
                    &mut self.state.lock(),
                    task_id,
                    TaskStatus::Failed,
                    None,
                    Some(error),
                );
                if let Some(task) = task {
                    self.publish_finished(task);
                }
            }
        }
        dispatched
    }

    /// One scheduling tick: demote stale workers, then place tasks.
    pub async fn tick(&self) -> usize {
        let stale_after = Duration::from_secs(self.config.worker_stale_secs);
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            for worker in state.workers.values_mut() {
                let idle = now.saturating_duration_since(worker.last_seen);
                if worker.available && idle > stale_after {
                    warn!(
                        worker_id = %worker.id,
                        name = %worker.name,
                        "Worker heartbeat stale, marking unavailable",
                    );
                    worker.available = false;
                }
            }
        }
        *self.last_tick.lock() = Some(Instant::now());
        self.schedule().await
    }

    /// Counters across workers and tasks.
    pub fn stats(&self) -> RouterStats {
        let state = self.state.lock();
        RouterStats {
            pending: state.queue.count(TaskStatus::Pending),
            assigned: state.queue.count(TaskStatus::Assigned),
            in_progress: state.queue.count(TaskStatus::InProgress),
            archived: state.archive.len(),
            workers: state.workers.len(),
            available_workers: state.workers.values().filter(|w| w.is_available()).count(),
        }
    }

    // --- Background loops ---

    /// Starts the scheduling tick and the disconnect listener.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let router = Arc::clone(self);
        let ticker = spawn_periodic(
            "router-tick",
            Duration::from_secs(self.config.tick_interval_secs),
            shutdown.clone(),
            move || {
                let router = Arc::clone(&router);
                async move {
                    router.tick().await;
                }
            },
        );
        let listener = self.spawn_disconnect_listener(shutdown.clone());
        if let Some((_, old_ticker, old_listener)) =
            self.loops.lock().replace((shutdown, ticker, listener))
        {
            old_ticker.abort();
            old_listener.abort();
        }
    }

    /// Returns `true` while both background loops are alive.
    pub fn is_running(&self) -> bool {
        self.loops
            .lock()
            .as_ref()
            .is_some_and(|(_, t, l)| !t.is_finished() && !l.is_finished())
    }

    /// Time of the last completed tick.
    pub fn last_tick(&self) -> Option<Instant> {
        *self.last_tick.lock()
    }

    /// Restarts dead background loops and runs a tick immediately.
    pub async fn reinitialize(self: &Arc<Self>) -> SwitchyardResult<()> {
        let token = self.loops.lock().as_ref().map(|(t, _, _)| t.clone());
        if let Some(token) = token {
            if !self.is_running() && !token.is_cancelled() {
                info!("Restarting router loops");
                self.start(token);
            }
        }
        let dispatched = self.tick().await;
        info!(dispatched, "Router reinitialized");
        Ok(())
    }

    fn spawn_disconnect_listener(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let router = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ConnectionEvent::Disconnected { id, .. }) => {
                        let Some(router) = router.upgrade() else {
                            break;
                        };
                        router.remove_worker(id).await;
                    }
                    Ok(ConnectionEvent::Connected { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Router lagged behind connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // --- Internals ---

    fn timeout_for(&self, task: &Task) -> Duration {
        let ms = if task.metadata.timeout_ms == 0 {
            self.config.task_timeout_ms
        } else {
            task.metadata.timeout_ms
        };
        Duration::from_millis(ms)
    }

    fn spawn_timeout(&self, task_id: Uuid, timeout: Duration) -> AbortHandle {
        let router = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(router) = router.upgrade() {
                router.expire(task_id, timeout).await;
            }
        })
        .abort_handle()
    }

    async fn expire(&self, task_id: Uuid, timeout: Duration) {
        let task = {
            let mut state = self.state.lock();
            // Dropping the handle does not abort this (the calling) task.
            state.timers.remove(&task_id);
            let error = format!("Task timed out after {} ms", timeout.as_millis());
            finish_locked(&mut state, task_id, TaskStatus::Failed, None, Some(error))
        };
        if let Some(task) = task {
            warn!(task_id = %task_id, worker_id = ?task.assigned_worker, "Task timed out");
            self.publish_finished(task);
            self.schedule().await;
        }
    }

    fn publish_finished(&self, task: Task) {
        info!(task_id = %task.id, status = %task.status, error = ?task.error, "Task finished");
        let _ = self.events.send(TaskEvent::Finished(task));
    }
}

/// Moves a task to the archive in a terminal state and releases its
/// worker's load.
fn finish_locked(
    state: &mut RouterState,
    task_id: Uuid,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
) -> Option<Task> {
    let mut task = state.queue.remove(task_id)?;
    if let Some(timer) = state.timers.remove(&task_id) {
        timer.abort();
    }
    if let Some(worker_id) = task.assigned_worker {
        if let Some(worker) = state.workers.get_mut(&worker_id) {
            worker.load = worker.load.saturating_sub(LOAD_UNIT);
        }
    }
    task.result = result;
    task.error = error;
    task.set_status(status);
    state.archive.push(task.clone());
    Some(task)
}

struct RouterHandler {
    router: Weak<CapabilityRouter>,
}

#[async_trait]
impl MessageHandler for RouterHandler {
    async fn handle(&self, connection_id: Uuid, message: InboundMessage) -> SwitchyardResult<()> {
        let Some(router) = self.router.upgrade() else {
            return Err(SwitchyardError::Routing("Router is shut down".into()));
        };
        match message {
            InboundMessage::BotHeartbeat(hb) | InboundMessage::ServiceStatus(hb) => {
                router.handle_heartbeat(connection_id, hb).await;
                Ok(())
            }
            InboundMessage::WorkerRegister(reg) => {
                router
                    .register_worker(connection_id, reg.name, reg.capabilities)
                    .await;
                Ok(())
            }
            InboundMessage::TaskUpdate(update) => {
                router.handle_task_update(Some(connection_id), update).await
            }
            other => Err(SwitchyardError::Protocol(format!(
                "Router cannot handle '{}'",
                other.kind()
            ))),
        }
    }
}
