//! Sync events: the unit of propagation between devices.
//!
//! A `SyncEvent` is an immutable record of one change to one resource.
//! The `changes` payload is forwarded untouched; the sync layer never
//! interprets it. Ordering is by `sequence`, which the coordinator assigns
//! exactly once when the event is durably persisted. Client timestamps are
//! informational only since device clocks drift.

use crate::{DeviceId, Error, EventId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of change an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A resource was created.
    Create,
    /// A resource was modified.
    Update,
    /// A resource was removed.
    Delete,
}

impl EventType {
    /// Returns the wire name of this event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidEventType(other.to_string())),
        }
    }
}

/// Identifies the entity an event applies to. Opaque to the sync layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceKey {
    /// Creates a resource key.
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

/// An immutable record of one change, as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    /// Unique identifier, assigned at creation.
    pub id: EventId,

    /// Owning user; fan-out never crosses users.
    pub user_id: UserId,

    /// Originating device; used to suppress echo-back.
    pub device_id: DeviceId,

    /// What happened to the resource.
    pub event_type: EventType,

    /// Type of the affected resource (e.g. "bookmark", "collection").
    pub resource_type: String,

    /// Identifier of the affected resource.
    pub resource_id: String,

    /// Opaque diff or snapshot, forwarded without interpretation.
    #[serde(default)]
    pub changes: serde_json::Value,

    /// Creation time on the originating device.
    pub timestamp: DateTime<Utc>,

    /// Per-user sequence assigned at persistence. `None` until the
    /// coordinator has accepted the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl SyncEvent {
    /// Creates a new, not yet persisted event.
    #[must_use]
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        event_type: EventType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        changes: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            user_id,
            device_id,
            event_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            changes,
            timestamp: Utc::now(),
            sequence: None,
        }
    }

    /// Creates a `create` event carrying the resource's initial state.
    #[must_use]
    pub fn create(
        user_id: UserId,
        device_id: DeviceId,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Self {
        Self::new(user_id, device_id, EventType::Create, resource_type, resource_id, snapshot)
    }

    /// Creates an `update` event carrying a diff or new snapshot.
    #[must_use]
    pub fn update(
        user_id: UserId,
        device_id: DeviceId,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        changes: serde_json::Value,
    ) -> Self {
        Self::new(user_id, device_id, EventType::Update, resource_type, resource_id, changes)
    }

    /// Creates a `delete` event.
    #[must_use]
    pub fn delete(
        user_id: UserId,
        device_id: DeviceId,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self::new(
            user_id,
            device_id,
            EventType::Delete,
            resource_type,
            resource_id,
            serde_json::Value::Null,
        )
    }

    /// Returns a copy of this event stamped with its persisted sequence.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Overrides the creation timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns the key of the resource this event applies to.
    #[must_use]
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.resource_id)
    }

    /// Whether the coordinator has assigned a sequence to this event.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.sequence.is_some()
    }

    /// Serializes the event to JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an event from JSON.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
