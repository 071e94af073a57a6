//! End-to-end orchestration test.
//!
//! Drives the registry, router and orchestrator together with fake workers
//! that speak only the wire envelope: they register, receive assignments and
//! report results exactly as a remote process would.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{CancellationToken, Capability, Envelope, InMemoryJobQueue};
use switchyard_gateway::{ConnectionHandle, ConnectionRegistry, OutboundFrame, RegistryConfig};
use switchyard_orchestrator::*;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fake worker: a registry connection whose frames we read directly
// ---------------------------------------------------------------------------

struct FakeWorker {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
    registry: Arc<ConnectionRegistry>,
}

impl FakeWorker {
    async fn connect(registry: &Arc<ConnectionRegistry>, name: &str, caps: &[&str]) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry
            .register(ConnectionHandle {
                path: "/ws/worker".into(),
                name: Some(name.into()),
                metadata: HashMap::new(),
                tx,
            })
            .await;
        let worker = Self {
            id,
            rx,
            registry: registry.clone(),
        };
        let caps = serde_json::to_string(caps).unwrap();
        worker
            .send(&format!(
                r#"{{"type":"worker_register","data":{{"name":"{name}","capabilities":{caps}}}}}"#
            ))
            .await;
        worker
    }

    async fn send(&self, frame: &str) {
        self.registry.handle_inbound(self.id, frame).await;
    }

    /// Task ids assigned since the last call, in dispatch order.
    fn assignments(&mut self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                let env = Envelope::parse(&text).unwrap();
                if env.msg_type == "task_assignment" {
                    ids.push(env.data["taskId"].as_str().unwrap().parse().unwrap());
                }
            }
        }
        ids
    }

    async fn report(&self, msg_type: &str, task_id: Uuid, status: &str) {
        self.send(&format!(concat!(
            r#"{{"type":"{msg_type}","data":{{"taskId":"{task_id}","#,
            r#""status":"{status}","result":{{"ok":true}}}}}}"#,
        ), msg_type = msg_type, task_id = task_id, status = status))
        .await;
    }
}

struct Hub {
    registry: Arc<ConnectionRegistry>,
    router: Arc<CapabilityRouter>,
    orchestrator: Arc<TaskOrchestrator>,
    token: CancellationToken,
}

fn hub() -> Hub {
    let registry = ConnectionRegistry::new(RegistryConfig::default());
    let router = CapabilityRouter::new(registry.clone(), RouterConfig::default());
    let orchestrator = TaskOrchestrator::new(
        router.clone(),
        registry.clone(),
        Arc::new(InMemoryJobQueue::new()),
        OrchestratorConfig::default(),
    );
    router.attach();
    orchestrator.attach();
    let token = CancellationToken::new();
    router.start(token.clone());
    orchestrator.start(token.clone());
    Hub {
        registry,
        router,
        orchestrator,
        token,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

struct FinishedLog(Mutex<Vec<Uuid>>);

#[async_trait]
impl CompletionHook for FinishedLog {
    async fn on_task_finished(&self, task: &Task) {
        self.0.lock().push(task.id);
    }
}

// ---------------------------------------------------------------------------
// 1. Tasks reach the only qualifying worker and complete through task_result
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_flows_to_qualifying_worker_and_completes() {
    let hub = hub();
    let finished = Arc::new(FinishedLog(Mutex::new(Vec::new())));
    hub.orchestrator.set_completion_hook(finished.clone());

    let mut writer = FakeWorker::connect(&hub.registry, "writer", &["chat", "post"]).await;
    let mut coder = FakeWorker::connect(&hub.registry, "coder", &["code", "review", "test"]).await;

    let id = hub
        .orchestrator
        .create_task(
            "review",
            serde_json::json!({"pr": 17}),
            TaskOptions::requiring([Capability::Code, Capability::Review]),
        )
        .await
        .unwrap();
    settle().await;

    assert!(writer.assignments().is_empty());
    assert_eq!(coder.assignments(), vec![id]);

    coder.report("task_update", id, "in_progress").await;
    settle().await;
    assert_eq!(
        hub.orchestrator.get_task_status(id).unwrap().status,
        TaskStatus::InProgress
    );

    coder.report("task_result", id, "completed").await;
    settle().await;

    let task = hub.orchestrator.get_task_status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.assigned_worker, Some(coder.id));
    assert_eq!(*finished.0.lock(), vec![id]);
    assert_eq!(hub.orchestrator.stats().completed, 1);
    assert_eq!(hub.router.worker(coder.id).unwrap().load, 0);
    hub.token.cancel();
}

// ---------------------------------------------------------------------------
// 2. A worker that disconnects hands its task to the next qualifying worker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnected_worker_task_is_reassigned() {
    let hub = hub();
    let mut first = FakeWorker::connect(&hub.registry, "first", &["build"]).await;

    let id = hub
        .orchestrator
        .create_task("build", serde_json::Value::Null, TaskOptions::requiring([Capability::Build]))
        .await
        .unwrap();
    settle().await;
    assert_eq!(first.assignments(), vec![id]);

    hub.registry.unregister(first.id).await;
    settle().await;
    assert_eq!(
        hub.orchestrator.get_task_status(id).unwrap().status,
        TaskStatus::Pending
    );

    let mut second = FakeWorker::connect(&hub.registry, "second", &["build", "deploy"]).await;
    settle().await;
    assert_eq!(second.assignments(), vec![id]);

    second.report("task_result", id, "failed").await;
    settle().await;
    let task = hub.orchestrator.get_task_status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Worker reported failure"));

    let retry = hub.orchestrator.retry_task(id).await.unwrap();
    settle().await;
    assert_eq!(second.assignments(), vec![retry]);
    hub.token.cancel();
}

// ---------------------------------------------------------------------------
// 3. Results from a worker that does not hold the task change nothing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn foreign_result_is_ignored() {
    let hub = hub();
    let mut holder = FakeWorker::connect(&hub.registry, "holder", &["research"]).await;
    let bystander = FakeWorker::connect(&hub.registry, "bystander", &["analysis"]).await;

    let id = hub
        .orchestrator
        .create_task(
            "research",
            serde_json::Value::Null,
            TaskOptions::requiring([Capability::Research]),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(holder.assignments(), vec![id]);

    bystander.report("task_result", id, "completed").await;
    settle().await;
    assert_eq!(
        hub.orchestrator.get_task_status(id).unwrap().status,
        TaskStatus::Assigned
    );
    assert_eq!(hub.orchestrator.list_active().len(), 1);
    hub.token.cancel();
}

// ---------------------------------------------------------------------------
// 4. A saturated worker receives work as soon as it reports headroom
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn saturated_worker_gets_task_after_load_drops() {
    let hub = hub();
    let mut bot = FakeWorker::connect(&hub.registry, "bot", &["media"]).await;
    bot.send(r#"{"type":"bot_heartbeat","data":{"load":100}}"#).await;

    let id = hub
        .orchestrator
        .create_task("render", serde_json::Value::Null, TaskOptions::requiring([Capability::Media]))
        .await
        .unwrap();
    settle().await;
    assert!(bot.assignments().is_empty());

    bot.send(r#"{"type":"bot_heartbeat","data":{"load":40}}"#).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(bot.assignments(), vec![id]);
    assert_eq!(hub.router.worker(bot.id).unwrap().load, 50);
    hub.token.cancel();
}
