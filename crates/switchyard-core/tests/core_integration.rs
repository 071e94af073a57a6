#![allow(clippy::unwrap_used, clippy::expect_used)]

use switchyard_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. A worker's registration frame decodes into a typed capability set
// ---------------------------------------------------------------------------

#[test]
fn worker_registration_frame_decodes() {
    let frame =
        r#"{"type":"worker_register","data":{"name":"builder-1","capabilities":["build","test"]}}"#;
    let env = Envelope::parse(frame).unwrap();
    let msg = InboundMessage::decode(&env).unwrap().unwrap();

    assert_eq!(msg.kind(), MessageKind::WorkerRegister);
    let InboundMessage::WorkerRegister(reg) = msg else {
        panic!("expected registration");
    };
    assert_eq!(reg.name, "builder-1");
    assert!(reg.capabilities.contains(Capability::Build));
    assert!(reg
        .capabilities
        .is_superset_of(&CapabilitySet::from([Capability::Test])));
}

// ---------------------------------------------------------------------------
// 2. Every dispatchable kind survives tag lookup
// ---------------------------------------------------------------------------

#[test]
fn message_kind_tags_are_unique_and_resolvable() {
    for kind in MessageKind::ALL {
        assert_eq!(MessageKind::from_type(kind.as_str()), Some(kind));
    }
    assert_eq!(MessageKind::from_type("repo_update"), None);
}

// ---------------------------------------------------------------------------
// 3. Outbound frames keep the { type, data } shape
// ---------------------------------------------------------------------------

#[test]
fn outbound_frames_are_envelopes() {
    let id = Uuid::new_v4();
    let welcome = OutboundMessage::Welcome {
        connection_id: id,
        kind: ConnectionKind::Service,
    }
    .to_json()
    .unwrap();

    let parsed: serde_json::Value = serde_json::from_str(&welcome).unwrap();
    assert_eq!(parsed["type"], "welcome");
    assert_eq!(parsed["data"]["connectionId"], id.to_string());
    assert_eq!(parsed["data"]["kind"], "service");

    let failed = OutboundMessage::ServiceRestartFailed {
        service_id: "router".into(),
        error: "cooldown".into(),
    }
    .to_envelope()
    .unwrap();
    assert_eq!(failed.msg_type, "service:restart_failed");
    assert_eq!(failed.data["serviceId"], "router");
}

// ---------------------------------------------------------------------------
// 4. Garbage text is a serialization error, not a panic
// ---------------------------------------------------------------------------

#[test]
fn garbage_frame_is_an_error() {
    let err = Envelope::parse("<<not json>>").unwrap_err();
    assert!(matches!(err, SwitchyardError::Serialization(_)));
}
