use crate::monitor::ServiceHealthStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::SwitchyardResult;
use tokio::time::Instant;

/// What a recovery action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Reinitialize the service in place.
    Restart,
    /// Switch to a standby.
    Failover,
    /// Shed optional functionality.
    Degrade,
    /// Tell a human.
    Notify,
}

impl RecoveryKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryKind::Restart => "restart",
            RecoveryKind::Failover => "failover",
            RecoveryKind::Degrade => "degrade",
            RecoveryKind::Notify => "notify",
        }
    }
}

impl std::fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The body of a recovery action. Must be safe to run more than once.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Attempts recovery given the service's latest status.
    async fn recover(&self, status: &ServiceHealthStatus) -> SwitchyardResult<()>;
}

struct FnRecovery<F>(F);

#[async_trait]
impl<F, Fut> RecoveryHandler for FnRecovery<F>
where
    F: Fn(ServiceHealthStatus) -> Fut + Send + Sync,
    Fut: Future<Output = SwitchyardResult<()>> + Send,
{
    async fn recover(&self, status: &ServiceHealthStatus) -> SwitchyardResult<()> {
        (self.0)(status.clone()).await
    }
}

/// Wraps an async closure as a [`RecoveryHandler`].
pub fn recovery_fn<F, Fut>(f: F) -> Arc<dyn RecoveryHandler>
where
    F: Fn(ServiceHealthStatus) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwitchyardResult<()>> + Send + 'static,
{
    Arc::new(FnRecovery(f))
}

type Applicability = Arc<dyn Fn(&ServiceHealthStatus) -> bool + Send + Sync>;

/// A prioritized, cooldown-gated recovery step for one service.
#[derive(Clone)]
pub struct RecoveryAction {
    /// Service this action targets.
    pub service_id: String,
    /// What the action does.
    pub kind: RecoveryKind,
    /// Lower runs first.
    pub priority: u32,
    /// Minimum time between two triggers.
    pub cooldown: Duration,
    applies: Applicability,
    handler: Arc<dyn RecoveryHandler>,
    last_triggered: Option<Instant>,
}

impl std::fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryAction")
            .field("service_id", &self.service_id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("cooldown", &self.cooldown)
            .field("last_triggered", &self.last_triggered)
            .finish_non_exhaustive()
    }
}

impl RecoveryAction {
    /// An always-applicable action with priority 0 and a 60 second cooldown.
    pub fn new(
        service_id: impl Into<String>,
        kind: RecoveryKind,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            kind,
            priority: 0,
            cooldown: Duration::from_secs(60),
            applies: Arc::new(|_| true),
            handler,
            last_triggered: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the cooldown.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Restricts the action to statuses matching `predicate`.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ServiceHealthStatus) -> bool + Send + Sync + 'static,
    {
        self.applies = Arc::new(predicate);
        self
    }

    /// Whether the predicate accepts `status`.
    pub fn is_applicable(&self, status: &ServiceHealthStatus) -> bool {
        (self.applies)(status)
    }

    /// Whether the action ran less than `cooldown` ago.
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.last_triggered
            .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown)
    }

    /// Time of the last trigger.
    pub fn last_triggered(&self) -> Option<Instant> {
        self.last_triggered
    }

    pub(crate) fn mark_triggered(&mut self, now: Instant) {
        self.last_triggered = Some(now);
    }

    pub(crate) fn handler(&self) -> Arc<dyn RecoveryHandler> {
        Arc::clone(&self.handler)
    }
}
