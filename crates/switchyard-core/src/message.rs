use crate::capability::CapabilitySet;
use crate::error::{SwitchyardError, SwitchyardResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// The `{ type, data }` frame exchanged in both directions over every
/// duplex connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag used for dispatch.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Type-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Creates an envelope from a type tag and an already-built payload.
    pub fn new(msg_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
        }
    }

    /// Parses a text frame.
    pub fn parse(text: &str) -> SwitchyardResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the envelope to a text frame.
    pub fn to_json(&self) -> SwitchyardResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What a connection is, derived from the endpoint it connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// A task-executing bot.
    Worker,
    /// A long-running service reporting status.
    Service,
    /// A dashboard or other observer.
    Client,
}

impl ConnectionKind {
    /// Classifies a connection from its request path.
    ///
    /// `/ws/worker` and `/ws/bot` are workers, `/ws/service` is a service,
    /// everything else is a client.
    pub fn from_path(path: &str) -> Self {
        let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        match last {
            "worker" | "bot" => ConnectionKind::Worker,
            "service" => ConnectionKind::Service,
            _ => ConnectionKind::Client,
        }
    }

    /// Lowercase name used in notices.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Worker => "worker",
            ConnectionKind::Service => "service",
            ConnectionKind::Client => "client",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Inbound ---

/// Inbound message types the hub knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Liveness probe from the peer.
    Ping,
    /// Worker load/availability report.
    BotHeartbeat,
    /// Service load/availability report.
    ServiceStatus,
    /// Explicit capability declaration.
    WorkerRegister,
    /// Progress or outcome of an assigned task.
    TaskUpdate,
    /// Final outcome of a task, addressed to the orchestrator.
    TaskResult,
    /// Request for the current system status snapshot.
    HealthCheck,
    /// Request for out-of-cycle recovery of one subsystem.
    ServiceRestart,
}

impl MessageKind {
    /// Every dispatchable kind.
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Ping,
        MessageKind::BotHeartbeat,
        MessageKind::ServiceStatus,
        MessageKind::WorkerRegister,
        MessageKind::TaskUpdate,
        MessageKind::TaskResult,
        MessageKind::HealthCheck,
        MessageKind::ServiceRestart,
    ];

    /// Wire type tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::BotHeartbeat => "bot_heartbeat",
            MessageKind::ServiceStatus => "service_status",
            MessageKind::WorkerRegister => "worker_register",
            MessageKind::TaskUpdate => "task_update",
            MessageKind::TaskResult => "task_result",
            MessageKind::HealthCheck => "health:check",
            MessageKind::ServiceRestart => "service:restart",
        }
    }

    /// Looks up a kind by wire tag.
    pub fn from_type(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == tag)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-reported load and availability from a worker or service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Reported load, 0-100. Values outside the range are clamped.
    #[serde(default)]
    pub load: Option<f64>,
    /// Reported availability flag.
    #[serde(default)]
    pub available: Option<bool>,
    /// Display name, used for implicit registration.
    #[serde(default)]
    pub name: Option<String>,
    /// Declared capabilities, used for implicit registration.
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Explicit worker registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    /// Display name.
    pub name: String,
    /// Declared capabilities.
    pub capabilities: CapabilitySet,
}

/// Status a worker may report for a task it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    /// Work has started.
    InProgress,
    /// Work finished successfully.
    Completed,
    /// Work finished with an error.
    Failed,
}

impl ReportedStatus {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportedStatus::Completed | ReportedStatus::Failed)
    }
}

/// Progress or outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    /// Task the update refers to.
    pub task_id: Uuid,
    /// New status.
    pub status: ReportedStatus,
    /// Result payload for completed tasks.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error description for failed tasks.
    #[serde(default)]
    pub error: Option<String>,
}

/// Request to run recovery for one subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRestartRequest {
    /// Subsystem id as registered with the resilience monitor.
    pub service_id: String,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Liveness probe.
    Ping,
    /// Worker heartbeat.
    BotHeartbeat(Heartbeat),
    /// Service heartbeat.
    ServiceStatus(Heartbeat),
    /// Capability declaration.
    WorkerRegister(WorkerRegistration),
    /// Task progress or outcome.
    TaskUpdate(TaskUpdate),
    /// Task outcome addressed to the orchestrator.
    TaskResult(TaskUpdate),
    /// Snapshot request.
    HealthCheck,
    /// Out-of-cycle recovery request.
    ServiceRestart(ServiceRestartRequest),
}

impl InboundMessage {
    /// The dispatch key of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::Ping => MessageKind::Ping,
            InboundMessage::BotHeartbeat(_) => MessageKind::BotHeartbeat,
            InboundMessage::ServiceStatus(_) => MessageKind::ServiceStatus,
            InboundMessage::WorkerRegister(_) => MessageKind::WorkerRegister,
            InboundMessage::TaskUpdate(_) => MessageKind::TaskUpdate,
            InboundMessage::TaskResult(_) => MessageKind::TaskResult,
            InboundMessage::HealthCheck => MessageKind::HealthCheck,
            InboundMessage::ServiceRestart(_) => MessageKind::ServiceRestart,
        }
    }

    /// Decodes the payload of an envelope according to its type tag.
    ///
    /// Returns `Ok(None)` for type tags the hub does not know, and an error
    /// when a known tag carries a malformed payload.
    pub fn decode(envelope: &Envelope) -> SwitchyardResult<Option<Self>> {
        let Some(kind) = MessageKind::from_type(&envelope.msg_type) else {
            return Ok(None);
        };
        let data = envelope.data.clone();
        let message = match kind {
            MessageKind::Ping => InboundMessage::Ping,
            MessageKind::HealthCheck => InboundMessage::HealthCheck,
            MessageKind::BotHeartbeat => InboundMessage::BotHeartbeat(payload(kind, data)?),
            MessageKind::ServiceStatus => InboundMessage::ServiceStatus(payload(kind, data)?),
            MessageKind::WorkerRegister => InboundMessage::WorkerRegister(payload(kind, data)?),
            MessageKind::TaskUpdate => InboundMessage::TaskUpdate(payload(kind, data)?),
            MessageKind::TaskResult => InboundMessage::TaskResult(payload(kind, data)?),
            MessageKind::ServiceRestart => InboundMessage::ServiceRestart(payload(kind, data)?),
        };
        Ok(Some(message))
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: MessageKind,
    data: serde_json::Value,
) -> SwitchyardResult<T> {
    // Heartbeats may legitimately arrive with no data at all.
    let data = if data.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| SwitchyardError::Protocol(format!("Malformed '{kind}' payload: {e}")))
}

// --- Outbound ---

/// Work dispatched to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    /// Task id the worker must echo in its updates.
    pub task_id: Uuid,
    /// Task type tag.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Task priority.
    pub priority: u8,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Capabilities the task requires.
    pub required_capabilities: CapabilitySet,
}

/// Messages the hub sends.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Post-connect acknowledgement.
    Welcome {
        /// Id assigned to the new connection.
        connection_id: Uuid,
        /// Classified kind.
        kind: ConnectionKind,
    },
    /// Reply to `ping`.
    Pong,
    /// Work dispatch.
    TaskAssignment(TaskAssignment),
    /// A connection of some kind came online or went offline.
    ConnectionNotice {
        /// Connection the notice is about.
        connection_id: Uuid,
        /// Its kind.
        kind: ConnectionKind,
        /// `true` for online, `false` for offline.
        online: bool,
    },
    /// Resilience snapshot.
    SystemStatus(serde_json::Value),
    /// Out-of-cycle recovery succeeded.
    ServiceRestarted {
        /// Subsystem id.
        service_id: String,
        /// Kind of the action that succeeded.
        action: String,
    },
    /// Out-of-cycle recovery failed.
    ServiceRestartFailed {
        /// Subsystem id.
        service_id: String,
        /// Failure description.
        error: String,
    },
}

impl OutboundMessage {
    /// Wire type tag.
    pub fn message_type(&self) -> String {
        match self {
            OutboundMessage::Welcome { .. } => "welcome".to_string(),
            OutboundMessage::Pong => "pong".to_string(),
            OutboundMessage::TaskAssignment(_) => "task_assignment".to_string(),
            OutboundMessage::ConnectionNotice { kind, online, .. } => {
                let state = if *online { "online" } else { "offline" };
                format!("{kind}_{state}")
            }
            OutboundMessage::SystemStatus(_) => "system:status".to_string(),
            OutboundMessage::ServiceRestarted { .. } => "service:restarted".to_string(),
            OutboundMessage::ServiceRestartFailed { .. } => "service:restart_failed".to_string(),
        }
    }

    /// Builds the envelope for this message.
    pub fn to_envelope(&self) -> SwitchyardResult<Envelope> {
        let data = match self {
            OutboundMessage::Welcome {
                connection_id,
                kind,
            } => serde_json::json!({ "connectionId": connection_id, "kind": kind }),
            OutboundMessage::Pong => serde_json::json!({}),
            OutboundMessage::TaskAssignment(assignment) => serde_json::to_value(assignment)?,
            OutboundMessage::ConnectionNotice {
                connection_id,
                kind,
                online,
            } => serde_json::json!({
                "connectionId": connection_id,
                "kind": kind,
                "status": if *online { "online" } else { "offline" },
            }),
            OutboundMessage::SystemStatus(snapshot) => snapshot.clone(),
            OutboundMessage::ServiceRestarted { service_id, action } => {
                serde_json::json!({ "serviceId": service_id, "action": action })
            }
            OutboundMessage::ServiceRestartFailed { service_id, error } => {
                serde_json::json!({ "serviceId": service_id, "error": error })
            }
        };
        Ok(Envelope::new(self.message_type(), data))
    }

    /// Serializes to a text frame.
    pub fn to_json(&self) -> SwitchyardResult<String> {
        self.to_envelope()?.to_json()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    #[test]
    fn test_kind_from_path() {
        assert_eq!(ConnectionKind::from_path("/ws/worker"), ConnectionKind::Worker);
        assert_eq!(ConnectionKind::from_path("/ws/bot/"), ConnectionKind::Worker);
        assert_eq!(ConnectionKind::from_path("/ws/service"), ConnectionKind::Service);
        assert_eq!(ConnectionKind::from_path("/ws"), ConnectionKind::Client);
        assert_eq!(ConnectionKind::from_path(""), ConnectionKind::Client);
    }

    #[test]
    fn test_decode_task_update() {
        let id = Uuid::new_v4();
        let env = Envelope::parse(&format!(concat!(
            r#"{{"type":"task_update","data":{{"taskId":"{id}","#,
            r#""status":"completed","result":{{"ok":true}}}}}}"#,
        ), id = id))
        .unwrap();
        let msg = InboundMessage::decode(&env).unwrap().unwrap();
        match msg {
            InboundMessage::TaskUpdate(update) => {
                assert_eq!(update.task_id, id);
                assert_eq!(update.status, ReportedStatus::Completed);
                assert!(update.status.is_terminal());
                assert_eq!(update.result.unwrap()["ok"], true);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_heartbeat_without_data() {
        let env = Envelope::parse(r#"{"type":"bot_heartbeat"}"#).unwrap();
        let msg = InboundMessage::decode(&env).unwrap().unwrap();
        assert_eq!(msg, InboundMessage::BotHeartbeat(Heartbeat::default()));
    }

    #[test]
    fn test_decode_unknown_type_is_none() {
        let env = Envelope::parse(r#"{"type":"repo_update","data":{}}"#).unwrap();
        assert!(InboundMessage::decode(&env).unwrap().is_none());
    }

    #[test]
    fn test_decode_malformed_payload_is_error() {
        let env = Envelope::parse(r#"{"type":"task_update","data":{"taskId":"nope"}}"#).unwrap();
        let err = InboundMessage::decode(&env).unwrap_err();
        assert!(matches!(err, SwitchyardError::Protocol(_)));
    }

    #[test]
    fn test_registration_rejects_unknown_capability() {
        let env = Envelope::parse(
            r#"{"type":"worker_register","data":{"name":"bot","capabilities":["code","magic"]}}"#,
        )
        .unwrap();
        assert!(InboundMessage::decode(&env).is_err());
    }

    #[test]
    fn test_connection_notice_type() {
        let msg = OutboundMessage::ConnectionNotice {
            connection_id: Uuid::new_v4(),
            kind: ConnectionKind::Worker,
            online: false,
        };
        let env = msg.to_envelope().unwrap();
        assert_eq!(env.msg_type, "worker_offline");
        assert_eq!(env.data["status"], "offline");
    }

    #[test]
    fn test_assignment_wire_shape() {
        let assignment = TaskAssignment {
            task_id: Uuid::new_v4(),
            task_type: "build".into(),
            priority: 7,
            payload: serde_json::json!({"repo": "hub"}),
            required_capabilities: CapabilitySet::from([Capability::Build]),
        };
        let env = OutboundMessage::TaskAssignment(assignment).to_envelope().unwrap();
        assert_eq!(env.msg_type, "task_assignment");
        assert_eq!(env.data["type"], "build");
        assert_eq!(env.data["requiredCapabilities"][0], "build");
    }
}
