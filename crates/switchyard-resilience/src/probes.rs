//! Health probes and restart actions for the hub's own components.

use crate::monitor::{HealthProbe, ResilienceMonitor};
use crate::recovery::{recovery_fn, RecoveryAction, RecoveryKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::{ConnectionKind, SwitchyardError, SwitchyardResult};
use switchyard_gateway::ConnectionRegistry;
use switchyard_orchestrator::{CapabilityRouter, TaskOrchestrator};

/// Service id of the connection registry.
pub const REGISTRY_SERVICE: &str = "connection-registry";
/// Service id of the capability router.
pub const ROUTER_SERVICE: &str = "capability-router";
/// Service id of the task orchestrator.
pub const ORCHESTRATOR_SERVICE: &str = "task-orchestrator";

type Metrics = HashMap<String, serde_json::Value>;

/// Healthy while the liveness sweep runs and the table answers.
pub struct RegistryProbe(pub Arc<ConnectionRegistry>);

#[async_trait]
impl HealthProbe for RegistryProbe {
    async fn check(&self) -> SwitchyardResult<Metrics> {
        if !self.0.is_sweeping() {
            return Err(SwitchyardError::Health("Liveness sweep is not running".into()));
        }
        let mut metrics = Metrics::new();
        metrics.insert("connections".into(), self.0.connection_count().await.into());
        for kind in [ConnectionKind::Worker, ConnectionKind::Service, ConnectionKind::Client] {
            let count = self.0.count_by_kind(kind).await;
            metrics.insert(format!("{}s", kind.as_str()), count.into());
        }
        Ok(metrics)
    }
}

/// Healthy while the scheduling tick and disconnect listener run.
pub struct RouterProbe(pub Arc<CapabilityRouter>);

#[async_trait]
impl HealthProbe for RouterProbe {
    async fn check(&self) -> SwitchyardResult<Metrics> {
        if !self.0.is_running() {
            return Err(SwitchyardError::Health("Router loops are not running".into()));
        }
        let stats = self.0.stats();
        Ok(HashMap::from([
            ("pending".to_string(), stats.pending.into()),
            ("assigned".to_string(), stats.assigned.into()),
            ("inProgress".to_string(), stats.in_progress.into()),
            ("workers".to_string(), stats.workers.into()),
            ("availableWorkers".to_string(), stats.available_workers.into()),
        ]))
    }
}

/// Healthy while the orchestrator listens for task events.
pub struct OrchestratorProbe(pub Arc<TaskOrchestrator>);

#[async_trait]
impl HealthProbe for OrchestratorProbe {
    async fn check(&self) -> SwitchyardResult<Metrics> {
        if !self.0.is_listening() {
            return Err(SwitchyardError::Health("Task event listener is not running".into()));
        }
        let stats = self.0.stats();
        Ok(HashMap::from([
            ("active".to_string(), stats.active.into()),
            ("archived".to_string(), stats.archived.into()),
            ("failed".to_string(), stats.failed.into()),
        ]))
    }
}

/// Registers the three core components with their probes and a restart
/// action each.
pub fn register_core_services(
    monitor: &ResilienceMonitor,
    registry: &Arc<ConnectionRegistry>,
    router: &Arc<CapabilityRouter>,
    orchestrator: &Arc<TaskOrchestrator>,
) -> SwitchyardResult<()> {
    let cooldown = monitor.config().recovery_cooldown();

    monitor.register_service(
        REGISTRY_SERVICE,
        "Connection Registry",
        Arc::new(RegistryProbe(registry.clone())),
    );
    let target = registry.clone();
    monitor.add_recovery_action(
        RecoveryAction::new(
            REGISTRY_SERVICE,
            RecoveryKind::Restart,
            recovery_fn(move |_| {
                let target = target.clone();
                async move { target.reinitialize().await }
            }),
        )
        .with_cooldown(cooldown),
    )?;

    monitor.register_service(
        ROUTER_SERVICE,
        "Capability Router",
        Arc::new(RouterProbe(router.clone())),
    );
    let target = router.clone();
    monitor.add_recovery_action(
        RecoveryAction::new(
            ROUTER_SERVICE,
            RecoveryKind::Restart,
            recovery_fn(move |_| {
                let target = target.clone();
                async move { target.reinitialize().await }
            }),
        )
        .with_cooldown(cooldown),
    )?;

    monitor.register_service(
        ORCHESTRATOR_SERVICE,
        "Task Orchestrator",
        Arc::new(OrchestratorProbe(orchestrator.clone())),
    );
    let target = orchestrator.clone();
    monitor.add_recovery_action(
        RecoveryAction::new(
            ORCHESTRATOR_SERVICE,
            RecoveryKind::Restart,
            recovery_fn(move |_| {
                let target = target.clone();
                async move { target.reinitialize().await }
            }),
        )
        .with_cooldown(cooldown),
    )?;

    Ok(())
}
