//! `switchyard.toml` loading and validation.

use serde::Deserialize;
use std::path::Path;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use switchyard_gateway::RegistryConfig;
use switchyard_orchestrator::{OrchestratorConfig, RouterConfig};
use switchyard_resilience::ResilienceConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Keys accepted on `/status`. Empty disables auth.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

impl HubConfig {
    /// Parses a TOML document.
    pub fn parse(text: &str) -> SwitchyardResult<Self> {
        toml::from_str(text).map_err(|e| SwitchyardError::Config(e.to_string()))
    }

    /// Reads `path`. A missing file yields the defaults; the bool reports
    /// whether the file was found.
    pub async fn load(path: &Path) -> SwitchyardResult<(Self, bool)> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok((Self::parse(&text)?, true)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Self::default(), false)),
            Err(e) => Err(SwitchyardError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))),
        }
    }

    /// Rejects zero intervals and a liveness timeout that would terminate
    /// connections between two sweeps.
    pub fn validate(&self) -> SwitchyardResult<()> {
        let intervals = [
            ("registry.heartbeat_interval_secs", self.registry.heartbeat_interval_secs),
            ("registry.liveness_timeout_secs", self.registry.liveness_timeout_secs),
            ("router.tick_interval_secs", self.router.tick_interval_secs),
            ("router.task_timeout_ms", self.router.task_timeout_ms),
            ("router.worker_stale_secs", self.router.worker_stale_secs),
            ("orchestrator.default_timeout_ms", self.orchestrator.default_timeout_ms),
            (
                "orchestrator.introspection_interval_secs",
                self.orchestrator.introspection_interval_secs,
            ),
            ("resilience.poll_interval_secs", self.resilience.poll_interval_secs),
            ("resilience.probe_timeout_secs", self.resilience.probe_timeout_secs),
            ("resilience.breaker_reset_secs", self.resilience.breaker_reset_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(SwitchyardError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.resilience.breaker_threshold == 0 {
            return Err(SwitchyardError::Config(
                "resilience.breaker_threshold must be greater than zero".into(),
            ));
        }
        if self.registry.liveness_timeout_secs <= self.registry.heartbeat_interval_secs {
            return Err(SwitchyardError::Config(format!(
                "registry.liveness_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.registry.liveness_timeout_secs, self.registry.heartbeat_interval_secs
            )));
        }
        if self.router.archive_capacity == 0 || self.orchestrator.archive_capacity == 0 {
            return Err(SwitchyardError::Config(
                "archive_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
