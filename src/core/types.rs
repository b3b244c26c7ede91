//! Core types: identifiers, versions and the entities kept in the local store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt::Display, str::FromStr};

use crate::core::lww::{self, LwwError};

/// Errors produced when parsing hex identifiers.
#[derive(Debug, thiserror::Error)]
pub enum IdParseError {
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("Expected 32 bytes, got {0}")]
    Length(usize),
}

macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name([u8; 32]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)?;
                let len = bytes.len();
                let arr: [u8; 32] = bytes.try_into().map_err(|_| IdParseError::Length(len))?;
                Ok(Self(arr))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// Content-addressed 32-byte hash.
    Hash
);

hex_id!(
    /// Ed25519-sized public key of a peer. Verification happens in the transport.
    PublicKey
);

/// Idempotency key of an [`ApplicationEvent`](crate::core::ApplicationEvent).
pub type OperationId = Hash;
/// Id of a calendar, which is the operation id of its `calendar_created` event.
pub type CalendarId = Hash;
/// Id of any calendar-scoped entity (the operation id of its creation event).
pub type EntityId = Hash;

/// Position of a write in the last-writer-wins order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: u64,
    pub operation_id: OperationId,
}

impl Version {
    pub fn new(timestamp: u64, operation_id: OperationId) -> Self {
        Self {
            timestamp,
            operation_id,
        }
    }

    /// `true` if `update` wins over `self`.
    pub fn is_superseded_by(&self, update: &Version) -> Result<bool, LwwError> {
        lww::should_update(
            self.timestamp,
            &self.operation_id,
            update.timestamp,
            &update.operation_id,
        )
    }
}

// ─────────────────────────── Roles ───────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    /// Owners and admins manage a calendar.
    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        };
        write!(f, "{role}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub calendar_id: CalendarId,
    pub public_key: PublicKey,
    pub name: Option<String>,
    pub role: Role,
    /// Version of the last role assignment, `None` for the implicit role.
    pub role_version: Option<Version>,
}

// ─────────────────────────── Entities ───────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarFields {
    pub name: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceFields {
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub capacity: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFields {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFields {
    pub name: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub space_id: Option<EntityId>,
    #[serde(default)]
    pub resource_ids: Vec<EntityId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Calendar,
    Space,
    Resource,
    Event,
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            EntityKind::Calendar => "calendar",
            EntityKind::Space => "space",
            EntityKind::Resource => "resource",
            EntityKind::Event => "event",
        };
        write!(f, "{kind}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum EntityFields {
    Calendar(CalendarFields),
    Space(SpaceFields),
    Resource(ResourceFields),
    Event(EventFields),
}

impl EntityFields {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityFields::Calendar(_) => EntityKind::Calendar,
            EntityFields::Space(_) => EntityKind::Space,
            EntityFields::Resource(_) => EntityKind::Resource,
            EntityFields::Event(_) => EntityKind::Event,
        }
    }
}

/// A stored calendar, space, resource or event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// Equal to `id` for calendars.
    pub calendar_id: CalendarId,
    pub author: PublicKey,
    pub created: Version,
    pub updated: Version,
    pub fields: EntityFields,
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        self.fields.kind()
    }

    pub fn name(&self) -> &str {
        match &self.fields {
            EntityFields::Calendar(f) => &f.name,
            EntityFields::Space(f) => &f.name,
            EntityFields::Resource(f) => &f.name,
            EntityFields::Event(f) => &f.name,
        }
    }
}

// ─────────────────────────── Request / response logs ───────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: OperationId,
    pub calendar_id: CalendarId,
    pub public_key: PublicKey,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessResponse {
    pub id: OperationId,
    pub request_id: OperationId,
    pub from_public_key: PublicKey,
    pub accept: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: OperationId,
    pub calendar_id: CalendarId,
    pub event_id: EntityId,
    /// A space or a resource.
    pub resource_id: EntityId,
    pub requester: PublicKey,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingResponse {
    pub id: OperationId,
    pub request_id: OperationId,
    pub responder: PublicKey,
    pub accept: bool,
    pub version: Version,
}
