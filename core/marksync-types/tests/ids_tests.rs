use marksync_types::{DeviceId, EventId, UserId};
use std::collections::HashSet;
use std::str::FromStr;

// ── EventId ───────────────────────────────────────────────────────

#[test]
fn event_id_unique() {
    assert_ne!(EventId::new(), EventId::new());
}

#[test]
fn event_id_display_roundtrip() {
    let id = EventId::new();
    let parsed: EventId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn event_id_from_str_invalid() {
    assert!(EventId::from_str("not-a-uuid").is_err());
}

#[test]
fn event_ids_sort_by_creation() {
    let a = EventId::new();
    let b = EventId::new();
    assert!(a < b);
}

#[test]
fn event_id_serializes_as_plain_string() {
    let id = EventId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
}

// ── UserId / DeviceId ────────────────────────────────────────────

#[test]
fn opaque_ids_are_transparent_on_the_wire() {
    let user = UserId::new("user-1");
    let device = DeviceId::from("laptop");
    assert_eq!(serde_json::to_string(&user).unwrap(), "\"user-1\"");
    assert_eq!(serde_json::to_string(&device).unwrap(), "\"laptop\"");

    let parsed: DeviceId = serde_json::from_str("\"phone\"").unwrap();
    assert_eq!(parsed.as_str(), "phone");
}

#[test]
fn opaque_id_empty_detection() {
    assert!(UserId::new("").is_empty());
    assert!(DeviceId::new("   ").is_empty());
    assert!(!DeviceId::new("d").is_empty());
}

#[test]
fn opaque_ids_hash_by_value() {
    let mut set = HashSet::new();
    set.insert(DeviceId::new("a"));
    set.insert(DeviceId::from(String::from("a")));
    set.insert(DeviceId::new("b"));
    assert_eq!(set.len(), 2);
}
