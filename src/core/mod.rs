//! Core library for local reconciliation of calendar events.
//!
//! Everything in here is transport-agnostic: events come in as
//! [`ApplicationEvent`]s, state lives behind the [`Store`] trait, and
//! network side effects are returned as [`SyncEffect`]s for the app layer.
//!
//! # Key Components
//!
//! - [`process_event`] / [`apply_event`] - idempotent per-event-type handlers
//! - [`access`] - access state derived from the request/response logs
//! - [`lww`] - last-writer-wins comparator

pub mod access;
mod error;
mod events;
pub mod lww;
mod processor;
mod store;
mod types;

pub use access::{access_state, booking_status, has_access, AccessState, BookingStatus};
pub use error::{CoreError, Dependency, ProcessError, StoreError};
pub use events::{
    calendar_data_log, calendar_inbox_log, new_calendar_log, AccessRequested, ApplicationEvent,
    BookingRequested, CalendarScoped, EntityRef, EntityUpdate, EventMeta, EventPayload,
    InviteCodeMessage, ResponseRef, RoleAssigned, StreamId,
};
pub use lww::{should_update, LwwError};
pub use processor::{apply_event, process_event, ProcessResult, SyncEffect};
pub use store::{MemoryStore, Store};
pub use types::{
    AccessRequest, AccessResponse, BookingRequest, BookingResponse, CalendarFields, CalendarId,
    Entity, EntityFields, EntityId, EntityKind, EventFields, Hash, IdParseError, OperationId,
    PublicKey, ResourceFields, Role, SpaceFields, User, Version,
};
