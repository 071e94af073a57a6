#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::{CancellationToken, Envelope, InMemoryJobQueue};
use switchyard_gateway::{ConnectionHandle, ConnectionRegistry, OutboundFrame, RegistryConfig};
use switchyard_orchestrator::{
    CapabilityRouter, OrchestratorConfig, RouterConfig, TaskOrchestrator,
};
use switchyard_resilience::*;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Hub {
    registry: Arc<ConnectionRegistry>,
    router: Arc<CapabilityRouter>,
    monitor: Arc<ResilienceMonitor>,
    token: CancellationToken,
}

/// Wires the full hub. `start_registry = false` leaves the liveness sweep off.
fn hub(start_registry: bool) -> Hub {
    let token = CancellationToken::new();
    let registry = ConnectionRegistry::new(RegistryConfig::default());
    let router = CapabilityRouter::new(registry.clone(), RouterConfig::default());
    let orchestrator = TaskOrchestrator::new(
        router.clone(),
        registry.clone(),
        Arc::new(InMemoryJobQueue::new()),
        OrchestratorConfig::default(),
    );
    let monitor = ResilienceMonitor::new(registry.clone(), ResilienceConfig::default());
    register_core_services(&monitor, &registry, &router, &orchestrator).unwrap();
    monitor.attach();

    if start_registry {
        registry.start(token.child_token());
    }
    router.start(token.child_token());
    orchestrator.start(token.child_token());

    Hub {
        registry,
        router,
        monitor,
        token,
    }
}

async fn client(registry: &ConnectionRegistry) -> (Uuid, mpsc::UnboundedReceiver<OutboundFrame>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = registry
        .register(ConnectionHandle {
            path: "/ws/client".into(),
            name: Some("dashboard".into()),
            metadata: HashMap::new(),
            tx,
        })
        .await;
    while rx.try_recv().is_ok() {}
    (id, rx)
}

fn last_text(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Envelope {
    let mut last = None;
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Text(text) = frame {
            last = Some(Envelope::parse(&text).unwrap());
        }
    }
    last.expect("no text frame received")
}

// ---------------------------------------------------------------------------
// 1. A fully started hub reports every core service healthy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_hub_is_healthy() {
    let hub = hub(true);
    tokio::task::yield_now().await;

    let status = hub.monitor.poll_once().await;
    assert!(status.healthy, "unhealthy: {:?}", status.unhealthy_services);
    assert_eq!(status.services.len(), 3);
    for id in [REGISTRY_SERVICE, ROUTER_SERVICE, ORCHESTRATOR_SERVICE] {
        assert!(status.services[id].healthy, "{id} unhealthy");
        assert!(!status.circuit_breakers[id].is_open);
    }
    assert_eq!(status.services[ROUTER_SERVICE].metrics["workers"], 0);
    assert!(hub.router.is_running());
    hub.token.cancel();
}

// ---------------------------------------------------------------------------
// 2. A stopped component shows up as unhealthy in the broadcast snapshot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stopped_sweep_is_reported() {
    let hub = hub(false);
    let (_id, mut rx) = client(&hub.registry).await;

    let status = hub.monitor.poll_once().await;
    assert!(!status.healthy);
    assert_eq!(status.unhealthy_services, vec![REGISTRY_SERVICE.to_string()]);
    assert!(status.services[REGISTRY_SERVICE]
        .error
        .as_ref()
        .unwrap()
        .contains("Liveness sweep"));

    let env = last_text(&mut rx);
    assert_eq!(env.msg_type, "system:status");
    assert_eq!(env.data["healthy"], false);
    assert_eq!(env.data["unhealthyServices"][0], REGISTRY_SERVICE);
    hub.token.cancel();
}

// ---------------------------------------------------------------------------
// 3. Manual restart over the wire, gated by the action's cooldown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manual_restart_over_the_wire() {
    let hub = hub(true);
    let (id, mut rx) = client(&hub.registry).await;
    let frame =
        format!(r#"{{"type":"service:restart","data":{{"serviceId":"{ROUTER_SERVICE}"}}}}"#);

    hub.registry.handle_inbound(id, &frame).await;
    let env = last_text(&mut rx);
    assert_eq!(env.msg_type, "service:restarted");
    assert_eq!(env.data["serviceId"], ROUTER_SERVICE);
    assert_eq!(env.data["action"], "restart");

    hub.registry.handle_inbound(id, &frame).await;
    let env = last_text(&mut rx);
    assert_eq!(env.msg_type, "service:restart_failed");
    assert!(env.data["error"].as_str().unwrap().contains("No eligible"));

    hub.registry
        .handle_inbound(id, r#"{"type":"health:check","data":{}}"#)
        .await;
    let env = last_text(&mut rx);
    assert_eq!(env.msg_type, "system:status");
    assert_eq!(env.data["services"].as_object().unwrap().len(), 3);
    hub.token.cancel();
}
