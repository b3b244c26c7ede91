//! Wire messages: application events and invite-code rendezvous messages.
//!
//! Both are serialized as JSON. Application events use a `type` / `data`
//! envelope, invite-code messages are discriminated by `messageType`.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::core::types::{
    CalendarFields, CalendarId, EntityId, EventFields, OperationId, PublicKey, ResourceFields,
    Role, SpaceFields,
};

/// Identifier of an append-only stream, assigned by the node.
pub type StreamId = crate::core::types::Hash;

/// Metadata attached by the node when an event is published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub operation_id: OperationId,
    pub author: PublicKey,
    pub stream_id: StreamId,
    pub log_path: String,
    /// Microseconds since the unix epoch.
    pub timestamp: u64,
}

/// A signed, content-addressed state-change intent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationEvent {
    pub payload: EventPayload,
    pub meta: EventMeta,
}

impl ApplicationEvent {
    pub fn operation_id(&self) -> &OperationId {
        &self.meta.operation_id
    }

    pub fn author(&self) -> &PublicKey {
        &self.meta.author
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarScoped<F> {
    pub calendar_id: CalendarId,
    pub fields: F,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityUpdate<F> {
    pub id: EntityId,
    pub fields: F,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequested {
    pub calendar_id: CalendarId,
    pub event_id: EntityId,
    pub resource_id: EntityId,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRef {
    pub request_id: OperationId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequested {
    pub calendar_id: CalendarId,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssigned {
    pub calendar_id: CalendarId,
    pub public_key: PublicKey,
    pub role: Role,
}

/// Every state change a peer can publish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    CalendarCreated(CalendarFields),
    CalendarUpdated(EntityUpdate<CalendarFields>),
    CalendarDeleted(EntityRef),

    SpaceCreated(CalendarScoped<SpaceFields>),
    SpaceUpdated(EntityUpdate<SpaceFields>),
    SpaceDeleted(EntityRef),

    ResourceCreated(CalendarScoped<ResourceFields>),
    ResourceUpdated(EntityUpdate<ResourceFields>),
    ResourceDeleted(EntityRef),

    EventCreated(CalendarScoped<EventFields>),
    EventUpdated(EntityUpdate<EventFields>),
    EventDeleted(EntityRef),

    BookingRequested(BookingRequested),
    BookingAccepted(ResponseRef),
    BookingRejected(ResponseRef),

    CalendarAccessRequested(AccessRequested),
    CalendarAccessAccepted(ResponseRef),
    CalendarAccessRejected(ResponseRef),

    UserRoleAssigned(RoleAssigned),
}

impl EventPayload {
    /// The wire tag, used for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::CalendarCreated(_) => "calendar_created",
            EventPayload::CalendarUpdated(_) => "calendar_updated",
            EventPayload::CalendarDeleted(_) => "calendar_deleted",
            EventPayload::SpaceCreated(_) => "space_created",
            EventPayload::SpaceUpdated(_) => "space_updated",
            EventPayload::SpaceDeleted(_) => "space_deleted",
            EventPayload::ResourceCreated(_) => "resource_created",
            EventPayload::ResourceUpdated(_) => "resource_updated",
            EventPayload::ResourceDeleted(_) => "resource_deleted",
            EventPayload::EventCreated(_) => "event_created",
            EventPayload::EventUpdated(_) => "event_updated",
            EventPayload::EventDeleted(_) => "event_deleted",
            EventPayload::BookingRequested(_) => "booking_requested",
            EventPayload::BookingAccepted(_) => "booking_accepted",
            EventPayload::BookingRejected(_) => "booking_rejected",
            EventPayload::CalendarAccessRequested(_) => "calendar_access_requested",
            EventPayload::CalendarAccessAccepted(_) => "calendar_access_accepted",
            EventPayload::CalendarAccessRejected(_) => "calendar_access_rejected",
            EventPayload::UserRoleAssigned(_) => "user_role_assigned",
        }
    }
}

impl Display for EventPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.event_type())
    }
}

// ─────────────────────────── Log paths ───────────────────────────

/// Log a peer writes calendar data (spaces, resources, events, bookings) to.
pub fn calendar_data_log(calendar_id: &CalendarId) -> String {
    format!("calendar/{calendar_id}/data")
}

/// Log a peer writes access requests and responses to.
pub fn calendar_inbox_log(calendar_id: &CalendarId) -> String {
    format!("calendar/{calendar_id}/inbox")
}

/// Log for a new calendar. The calendar id is not known before publishing,
/// so every creation gets its own fresh log.
pub fn new_calendar_log() -> String {
    format!("calendar/new/{}", uuid::Uuid::new_v4())
}

// ─────────────────────────── Invite codes ───────────────────────────

/// Ephemeral rendezvous message mapping a short code to a calendar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum InviteCodeMessage {
    #[serde(rename_all = "camelCase")]
    Request { code: String, timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    Response {
        code: String,
        calendar_id: CalendarId,
        calendar_name: String,
    },
}

impl InviteCodeMessage {
    pub fn code(&self) -> &str {
        match self {
            InviteCodeMessage::Request { code, .. } => code,
            InviteCodeMessage::Response { code, .. } => code,
        }
    }
}
