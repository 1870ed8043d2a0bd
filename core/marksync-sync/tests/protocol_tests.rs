use marksync_sync::protocol::codes;
use marksync_sync::{
    CheckpointReport, ErrorMessage, EventAck, Heartbeat, SyncError, SyncMessage, SyncRequest,
    SyncResponse,
};
use marksync_types::{DeviceId, EventId, SyncEvent, UserId};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn event() -> SyncEvent {
    SyncEvent::create(
        UserId::new("u1"),
        DeviceId::new("laptop"),
        "bookmark",
        "b1",
        json!({"url": "https://example.com"}),
    )
}

fn to_value(message: &SyncMessage) -> Value {
    serde_json::from_str(&message.to_json().unwrap()).unwrap()
}

// ── Envelope ─────────────────────────────────────────────────────

#[test]
fn envelope_has_type_and_data() {
    let value = to_value(&SyncMessage::Ping(Heartbeat { timestamp: 42 }));
    assert_eq!(value, json!({"type": "ping", "data": {"timestamp": 42}}));
}

#[test]
fn kind_matches_envelope_type() {
    let messages = vec![
        SyncMessage::ping(),
        SyncMessage::Pong(Heartbeat { timestamp: 1 }),
        SyncMessage::SyncEvent(event()),
        SyncMessage::SyncRequest(SyncRequest {
            device_id: DeviceId::new("d"),
            last_sequence: 3,
        }),
        SyncMessage::SyncResponse(SyncResponse {
            events: vec![],
            last_sync_sequence: 3,
        }),
        SyncMessage::EventAck(EventAck {
            event_id: EventId::new(),
            sequence: 1,
        }),
        SyncMessage::Error(ErrorMessage {
            code: 400,
            message: "bad".into(),
            event_id: None,
        }),
        SyncMessage::Checkpoint(CheckpointReport { last_sequence: 9 }),
    ];
    for message in messages {
        let value = to_value(&message);
        assert_eq!(value["type"], message.kind());
        assert_eq!(SyncMessage::from_json(&message.to_json().unwrap()).unwrap(), message);
    }
}

// ── Payload shapes ───────────────────────────────────────────────

#[test]
fn sync_request_uses_camel_case() {
    let value = to_value(&SyncMessage::SyncRequest(SyncRequest {
        device_id: DeviceId::new("phone"),
        last_sequence: 9,
    }));
    assert_eq!(
        value,
        json!({"type": "sync_request", "data": {"deviceId": "phone", "lastSequence": 9}})
    );
}

#[test]
fn sync_response_carries_last_sync_sequence() {
    let value = to_value(&SyncMessage::SyncResponse(SyncResponse {
        events: vec![event().with_sequence(12)],
        last_sync_sequence: 12,
    }));
    assert_eq!(value["data"]["lastSyncSequence"], 12);
    assert_eq!(value["data"]["events"][0]["sequence"], 12);
    assert_eq!(value["data"]["events"][0]["eventType"], "create");
    assert_eq!(value["data"]["events"][0]["resourceType"], "bookmark");
}

#[test]
fn event_ack_shape() {
    let id = EventId::new();
    let value = to_value(&SyncMessage::EventAck(EventAck { event_id: id, sequence: 5 }));
    assert_eq!(value["data"]["eventId"], id.to_string());
    assert_eq!(value["data"]["sequence"], 5);
}

#[test]
fn error_omits_missing_event_id() {
    let value = to_value(&SyncMessage::Error(ErrorMessage {
        code: 503,
        message: "down".into(),
        event_id: None,
    }));
    assert_eq!(value, json!({"type": "error", "data": {"code": 503, "message": "down"}}));
}

#[test]
fn unsequenced_event_omits_sequence() {
    let value = to_value(&SyncMessage::SyncEvent(event()));
    assert!(value["data"].get("sequence").is_none());
}

// ── Parsing failures ─────────────────────────────────────────────

#[test]
fn unknown_type_is_protocol_error() {
    let err = SyncMessage::from_json(r#"{"type": "teleport", "data": {}}"#).unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
    assert_eq!(err.code(), codes::BAD_REQUEST);
}

#[test]
fn garbage_is_protocol_error() {
    assert!(matches!(
        SyncMessage::from_json("not json"),
        Err(SyncError::Protocol(_))
    ));
}

// ── Error mapping ────────────────────────────────────────────────

#[test]
fn error_codes() {
    assert_eq!(SyncError::Unauthorized("x".into()).code(), 401);
    assert_eq!(SyncError::StoreUnavailable("x".into()).code(), 503);
    assert_eq!(SyncError::Timeout.code(), 504);
    assert_eq!(SyncError::Protocol("x".into()).code(), 400);
    assert_eq!(SyncError::ChannelClosed.code(), 500);
}

#[test]
fn error_message_round_trips_to_error() {
    let id = EventId::new();
    let wire = ErrorMessage::from_error(&SyncError::StoreUnavailable("disk".into()), Some(id));
    assert_eq!(wire.code, 503);
    assert_eq!(wire.event_id, Some(id));

    let err = wire.into_error();
    assert!(matches!(err, SyncError::Rejected { code: 503, .. }));
    assert!(err.is_transient());
}

#[test]
fn unauthorized_wire_error_is_fatal() {
    let wire = ErrorMessage {
        code: codes::UNAUTHORIZED,
        message: "nope".into(),
        event_id: None,
    };
    let err = wire.into_error();
    assert!(matches!(err, SyncError::Unauthorized(_)));
    assert!(!err.is_transient());
}

#[test]
fn bad_request_is_not_transient() {
    let err = SyncError::Rejected {
        code: 400,
        message: "malformed".into(),
    };
    assert!(!err.is_transient());
}
