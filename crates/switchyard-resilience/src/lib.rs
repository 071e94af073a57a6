//! Health monitoring and automatic recovery for the Switchyard hub.
//!
//! The [`ResilienceMonitor`] polls a [`HealthProbe`] per registered service,
//! keeps a [`CircuitBreakerState`] for each, and runs prioritized,
//! cooldown-gated [`RecoveryAction`]s against unhealthy services. Its
//! [`SystemStatus`] snapshot is broadcast after every cycle and served on
//! demand.

/// Per-service circuit breaker.
pub mod circuit_breaker;
/// Poll loop, snapshot and recovery search.
pub mod monitor;
pub mod probes;
/// Recovery actions and handlers.
pub mod recovery;

pub use circuit_breaker::CircuitBreakerState;
pub use monitor::{
    HealthProbe, ResilienceConfig, ResilienceMonitor, ServiceHealthStatus, SystemStatus,
};
pub use probes::{
    register_core_services, OrchestratorProbe, RegistryProbe, RouterProbe, ORCHESTRATOR_SERVICE,
    REGISTRY_SERVICE, ROUTER_SERVICE,
};
pub use recovery::{recovery_fn, RecoveryAction, RecoveryHandler, RecoveryKind};
