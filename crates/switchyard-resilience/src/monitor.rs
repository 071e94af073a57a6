use crate::circuit_breaker::CircuitBreakerState;
use crate::recovery::{RecoveryAction, RecoveryKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchyard_core::{
    spawn_periodic, CancellationToken, InboundMessage, MessageKind, OutboundMessage,
    SwitchyardError, SwitchyardResult,
};
use switchyard_gateway::{ConnectionRegistry, MessageHandler, StatusSource};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Resilience monitor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Seconds between poll cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds a single probe may take before it counts as a failure.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Failures that open a breaker, and successes that close it.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Seconds without failure after which an open breaker is force-closed.
    #[serde(default = "default_breaker_reset_secs")]
    pub breaker_reset_secs: u64,
    /// Cooldown of the built-in restart actions.
    #[serde(default = "default_recovery_cooldown_secs")]
    pub recovery_cooldown_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_reset_secs() -> u64 {
    300
}
fn default_recovery_cooldown_secs() -> u64 {
    60
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            breaker_threshold: default_breaker_threshold(),
            breaker_reset_secs: default_breaker_reset_secs(),
            recovery_cooldown_secs: default_recovery_cooldown_secs(),
        }
    }
}

impl ResilienceConfig {
    /// Cooldown of the built-in restart actions.
    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }
}

/// Latest health of one monitored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthStatus {
    /// Service id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Result of the last check.
    pub healthy: bool,
    /// When the last check finished.
    pub last_check: Option<DateTime<Utc>>,
    /// Error from the last failed check.
    pub error: Option<String>,
    /// Metrics reported by the last successful check.
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
}

impl ServiceHealthStatus {
    /// A not-yet-checked service, presumed healthy.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            healthy: true,
            last_check: None,
            error: None,
            metrics: HashMap::new(),
        }
    }
}

/// Checks one service. `Ok` carries metrics, `Err` means unhealthy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Runs the check.
    async fn check(&self) -> SwitchyardResult<HashMap<String, serde_json::Value>>;
}

/// Snapshot of every monitored service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// `true` only if every service is healthy.
    pub healthy: bool,
    /// Ids of unhealthy services.
    pub unhealthy_services: Vec<String>,
    /// Per-service health.
    pub services: BTreeMap<String, ServiceHealthStatus>,
    /// Per-service breaker state.
    pub circuit_breakers: BTreeMap<String, CircuitBreakerState>,
}

struct MonitoredService {
    probe: Arc<dyn HealthProbe>,
    status: ServiceHealthStatus,
    breaker: CircuitBreakerState,
    actions: Vec<RecoveryAction>,
}

/// Polls every registered service, keeps a circuit breaker per service and
/// runs recovery actions for unhealthy ones.
pub struct ResilienceMonitor {
    registry: Arc<ConnectionRegistry>,
    config: ResilienceConfig,
    services: Mutex<BTreeMap<String, MonitoredService>>,
    last_poll: Mutex<Option<Instant>>,
    poller: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResilienceMonitor {
    /// Creates a monitor that broadcasts snapshots through `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, config: ResilienceConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            services: Mutex::new(BTreeMap::new()),
            last_poll: Mutex::new(None),
            poller: Mutex::new(None),
        })
    }

    /// Monitor configuration.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Registers a service. Re-registering an id replaces its probe and
    /// clears its actions.
    pub fn register_service(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
    ) {
        let id = id.into();
        let name = name.into();
        info!(service_id = %id, name = %name, "Monitoring service");
        self.services.lock().insert(
            id.clone(),
            MonitoredService {
                probe,
                status: ServiceHealthStatus::new(id, name),
                breaker: CircuitBreakerState::new(),
                actions: Vec::new(),
            },
        );
    }

    /// Adds a recovery action to its service, keeping actions in priority
    /// order.
    pub fn add_recovery_action(&self, action: RecoveryAction) -> SwitchyardResult<()> {
        let mut services = self.services.lock();
        let service = services.get_mut(&action.service_id).ok_or_else(|| {
            SwitchyardError::Recovery(format!("Unknown service '{}'", action.service_id))
        })?;
        debug!(
            service_id = %action.service_id,
            kind = %action.kind,
            priority = action.priority,
            "Recovery action registered",
        );
        service.actions.push(action);
        service.actions.sort_by_key(|a| a.priority);
        Ok(())
    }

    /// Ids of all monitored services.
    pub fn service_ids(&self) -> Vec<String> {
        self.services.lock().keys().cloned().collect()
    }

    /// Current snapshot, built without running any probe.
    pub fn system_status(&self) -> SystemStatus {
        let services = self.services.lock();
        let statuses: BTreeMap<String, ServiceHealthStatus> = services
            .iter()
            .map(|(id, s)| (id.clone(), s.status.clone()))
            .collect();
        let breakers = services
            .iter()
            .map(|(id, s)| (id.clone(), s.breaker.clone()))
            .collect();
        let unhealthy: Vec<String> = statuses
            .values()
            .filter(|s| !s.healthy)
            .map(|s| s.id.clone())
            .collect();
        SystemStatus {
            timestamp: Utc::now(),
            healthy: unhealthy.is_empty(),
            unhealthy_services: unhealthy,
            services: statuses,
            circuit_breakers: breakers,
        }
    }

    /// Runs one full cycle: probe every service, update breakers, attempt
    /// recovery for unhealthy services with closed breakers, then broadcast
    /// the snapshot.
    pub async fn poll_once(&self) -> SystemStatus {
        let probes: Vec<(String, Arc<dyn HealthProbe>)> = self
            .services
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(&s.probe)))
            .collect();

        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let results = join_all(probes.into_iter().map(|(id, probe)| async move {
            let outcome = run_probe(probe, timeout).await;
            (id, outcome)
        }))
        .await;

        let mut needs_recovery = Vec::new();
        for (id, outcome) in results {
            if self.record_check(&id, outcome) {
                needs_recovery.push(id);
            }
        }

        for id in needs_recovery {
            match self.attempt_recovery(&id, false).await {
                Ok(kind) => info!(service_id = %id, action = %kind, "Service recovered"),
                Err(e) => warn!(service_id = %id, error = %e, "Recovery unsuccessful"),
            }
        }

        *self.last_poll.lock() = Some(Instant::now());
        let snapshot = self.system_status();
        match serde_json::to_value(&snapshot) {
            Ok(value) => {
                self.registry
                    .broadcast_all(&OutboundMessage::SystemStatus(value))
                    .await;
            }
            Err(e) => error!(error = %e, "Failed to serialize system status"),
        }
        snapshot
    }

    /// Applies one probe outcome. Returns `true` if the service is unhealthy
    /// and its breaker allows automatic recovery.
    fn record_check(
        &self,
        id: &str,
        outcome: SwitchyardResult<HashMap<String, serde_json::Value>>,
    ) -> bool {
        let now = Instant::now();
        let threshold = self.config.breaker_threshold;
        let reset_window = Duration::from_secs(self.config.breaker_reset_secs);

        let mut services = self.services.lock();
        let Some(service) = services.get_mut(id) else {
            return false;
        };
        if service.breaker.maybe_reset(now, reset_window) {
            info!(service_id = %id, "Circuit breaker reset after quiet period");
        }

        let was_healthy = service.status.healthy;
        service.status.last_check = Some(Utc::now());
        match outcome {
            Ok(metrics) => {
                service.status.healthy = true;
                service.status.error = None;
                service.status.metrics = metrics;
                if service.breaker.record_success(threshold) {
                    info!(service_id = %id, "Circuit breaker closed");
                }
                if !was_healthy {
                    info!(service_id = %id, "Service is healthy again");
                }
            }
            Err(e) => {
                service.status.healthy = false;
                service.status.error = Some(e.to_string());
                if service.breaker.record_failure(now, threshold) {
                    warn!(
                        service_id = %id,
                        failures = service.breaker.failure_count,
                        "Circuit breaker opened",
                    );
                }
                if was_healthy {
                    warn!(service_id = %id, error = %e, "Service became unhealthy");
                }
            }
        }
        !service.status.healthy && !service.breaker.is_open
    }

    /// Runs the recovery search for one service outside the poll cycle.
    ///
    /// Ignores the breaker but honours cooldowns and applicability.
    pub async fn restart_service(&self, service_id: &str) -> SwitchyardResult<RecoveryKind> {
        info!(service_id = %service_id, "Manual recovery requested");
        self.attempt_recovery(service_id, true).await
    }

    /// Tries eligible actions in priority order until one succeeds.
    ///
    /// An action's cooldown is claimed before it runs, so concurrent callers
    /// cannot trigger it twice within one window.
    async fn attempt_recovery(
        &self,
        service_id: &str,
        manual: bool,
    ) -> SwitchyardResult<RecoveryKind> {
        let mut next_index = 0;
        let mut attempted = 0;
        loop {
            let claimed = {
                let now = Instant::now();
                let mut services = self.services.lock();
                let service = services.get_mut(service_id).ok_or_else(|| {
                    SwitchyardError::Recovery(format!("Unknown service '{service_id}'"))
                })?;
                if !manual && service.breaker.is_open {
                    return Err(SwitchyardError::Recovery(format!(
                        "Circuit breaker open for '{service_id}'"
                    )));
                }
                let status = service.status.clone();
                let found = service
                    .actions
                    .iter_mut()
                    .enumerate()
                    .skip(next_index)
                    .find(|(_, a)| a.is_applicable(&status) && !a.in_cooldown(now));
                found.map(|(index, action)| {
                    action.mark_triggered(now);
                    (index, action.kind, action.handler(), status)
                })
            };

            let Some((index, kind, handler, status)) = claimed else {
                break;
            };
            next_index = index + 1;
            attempted += 1;

            info!(service_id = %service_id, action = %kind, manual, "Running recovery action");
            match tokio::spawn(async move { handler.recover(&status).await }).await {
                Ok(Ok(())) => return Ok(kind),
                Ok(Err(e)) => {
                    warn!(
                        service_id = %service_id,
                        action = %kind,
                        error = %e,
                        "Recovery action failed",
                    );
                }
                Err(e) => {
                    error!(
                        service_id = %service_id,
                        action = %kind,
                        error = %e,
                        "Recovery action panicked",
                    );
                }
            }
        }

        if attempted == 0 {
            Err(SwitchyardError::Recovery(format!(
                "No eligible recovery action for '{service_id}'"
            )))
        } else {
            Err(SwitchyardError::Recovery(format!(
                "All {attempted} recovery action(s) for '{service_id}' failed"
            )))
        }
    }

    /// Installs `health:check` and `service:restart` handlers on the registry.
    pub fn attach(self: &Arc<Self>) {
        let handler: Arc<dyn MessageHandler> = Arc::new(MonitorHandler {
            monitor: Arc::downgrade(self),
        });
        self.registry
            .on_message(MessageKind::HealthCheck, handler.clone());
        self.registry.on_message(MessageKind::ServiceRestart, handler);
    }

    /// Starts the poll loop.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let monitor = Arc::clone(self);
        let token = shutdown.clone();
        let handle = spawn_periodic(
            "resilience-poll",
            Duration::from_secs(self.config.poll_interval_secs),
            shutdown,
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    monitor.poll_once().await;
                }
            },
        );
        if let Some((_, old)) = self.poller.lock().replace((token, handle)) {
            old.abort();
        }
    }

    /// Returns `true` while the poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .is_some_and(|(_, h)| !h.is_finished())
    }

    /// Time of the last completed poll cycle.
    pub fn last_poll(&self) -> Option<Instant> {
        *self.last_poll.lock()
    }

    async fn reply(&self, connection_id: Uuid, message: OutboundMessage) {
        self.registry.send(connection_id, &message).await;
    }
}

impl StatusSource for ResilienceMonitor {
    fn system_status(&self) -> serde_json::Value {
        serde_json::to_value(ResilienceMonitor::system_status(self))
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }))
    }
}

async fn run_probe(
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
) -> SwitchyardResult<HashMap<String, serde_json::Value>> {
    let mut task = tokio::spawn(async move { probe.check().await });
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(SwitchyardError::Health(format!("Probe panicked: {e}"))),
        Err(_) => {
            // A hung check must not outlive its cycle.
            task.abort();
            Err(SwitchyardError::Health(format!(
                "Probe timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
}

struct MonitorHandler {
    monitor: Weak<ResilienceMonitor>,
}

#[async_trait]
impl MessageHandler for MonitorHandler {
    async fn handle(&self, connection_id: Uuid, message: InboundMessage) -> SwitchyardResult<()> {
        let Some(monitor) = self.monitor.upgrade() else {
            return Err(SwitchyardError::Health("Resilience monitor is shut down".into()));
        };
        match message {
            InboundMessage::HealthCheck => {
                let snapshot = serde_json::to_value(monitor.system_status())?;
                monitor
                    .reply(connection_id, OutboundMessage::SystemStatus(snapshot))
                    .await;
                Ok(())
            }
            InboundMessage::ServiceRestart(request) => {
                let reply = match monitor.restart_service(&request.service_id).await {
                    Ok(kind) => OutboundMessage::ServiceRestarted {
                        service_id: request.service_id,
                        action: kind.to_string(),
                    },
                    Err(e) => {
                        warn!(
                            service_id = %request.service_id,
                            error = %e,
                            "Manual recovery failed",
                        );
                        OutboundMessage::ServiceRestartFailed {
                            service_id: request.service_id,
                            error: e.to_string(),
                        }
                    }
                };
                monitor.reply(connection_id, reply).await;
                Ok(())
            }
            other => Err(SwitchyardError::Protocol(format!(
                "Resilience monitor cannot handle '{}'",
                other.kind()
            ))),
        }
    }
}
