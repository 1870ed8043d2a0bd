use marksync_types::{DeviceId, EventType, ResourceKey, SyncEvent, UserId};
use pretty_assertions::assert_eq;
use serde_json::json;

fn user() -> UserId {
    UserId::new("user-1")
}

fn device() -> DeviceId {
    DeviceId::new("device-a")
}

// ── EventType ────────────────────────────────────────────────────

#[test]
fn event_type_wire_names() {
    assert_eq!(serde_json::to_string(&EventType::Create).unwrap(), "\"create\"");
    assert_eq!(serde_json::to_string(&EventType::Update).unwrap(), "\"update\"");
    assert_eq!(serde_json::to_string(&EventType::Delete).unwrap(), "\"delete\"");
}

#[test]
fn event_type_parse() {
    assert_eq!("update".parse::<EventType>().unwrap(), EventType::Update);
    assert!("upsert".parse::<EventType>().is_err());
}

// ── Constructors ─────────────────────────────────────────────────

#[test]
fn create_event_is_unpersisted() {
    let event = SyncEvent::create(user(), device(), "bookmark", "b1", json!({"url": "https://a"}));
    assert_eq!(event.event_type, EventType::Create);
    assert_eq!(event.sequence, None);
    assert!(!event.is_persisted());
}

#[test]
fn delete_event_has_null_changes() {
    let event = SyncEvent::delete(user(), device(), "bookmark", "b1");
    assert_eq!(event.event_type, EventType::Delete);
    assert!(event.changes.is_null());
}

#[test]
fn with_sequence_marks_persisted() {
    let event = SyncEvent::update(user(), device(), "collection", "c1", json!({"name": "x"}))
        .with_sequence(42);
    assert_eq!(event.sequence, Some(42));
    assert!(event.is_persisted());
}

#[test]
fn resource_key_identifies_entity() {
    let a = SyncEvent::create(user(), device(), "bookmark", "b1", json!({}));
    let b = SyncEvent::delete(user(), DeviceId::new("other"), "bookmark", "b1");
    assert_eq!(a.resource_key(), b.resource_key());
    assert_eq!(a.resource_key(), ResourceKey::new("bookmark", "b1"));
    assert_eq!(a.resource_key().to_string(), "bookmark/b1");
}

// ── Wire format ──────────────────────────────────────────────────

#[test]
fn wire_fields_are_camel_case() {
    let event = SyncEvent::create(user(), device(), "bookmark", "b1", json!({"title": "t"}))
        .with_sequence(7);
    let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

    assert_eq!(value["userId"], "user-1");
    assert_eq!(value["deviceId"], "device-a");
    assert_eq!(value["eventType"], "create");
    assert_eq!(value["resourceType"], "bookmark");
    assert_eq!(value["resourceId"], "b1");
    assert_eq!(value["changes"]["title"], "t");
    assert_eq!(value["sequence"], 7);
}

#[test]
fn unpersisted_event_omits_sequence() {
    let event = SyncEvent::delete(user(), device(), "bookmark", "b1");
    let value: serde_json::Value = serde_json::to_value(&event).unwrap();
    assert!(value.get("sequence").is_none());
}

#[test]
fn parses_client_payload_without_changes() {
    let id = marksync_types::EventId::new();
    let json = format!(
        r#"{{"id":"{id}","userId":"u","deviceId":"d","eventType":"delete",
            "resourceType":"bookmark","resourceId":"b9","timestamp":"2024-05-01T10:00:00Z"}}"#
    );
    let event = SyncEvent::from_json(&json).unwrap();
    assert_eq!(event.id, id);
    assert!(event.changes.is_null());
    assert_eq!(event.sequence, None);
}

#[test]
fn json_roundtrip_preserves_event() {
    let event = SyncEvent::update(user(), device(), "bookmark", "b2", json!({"tags": ["a", "b"]}))
        .with_sequence(3);
    let parsed = SyncEvent::from_json(&event.to_json().unwrap()).unwrap();
    assert_eq!(parsed, event);
}
