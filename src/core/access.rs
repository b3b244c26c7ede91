//! Access control derived from the request/response logs.
//!
//! There is no stored transition state. Every query scans the append-only
//! access and booking logs, so the answer does not depend on the order in
//! which requests and responses arrived.

use std::fmt::Display;

use crate::core::error::{CoreError, StoreError};
use crate::core::store::Store;
use crate::core::types::{
    AccessRequest, AccessResponse, BookingResponse, CalendarId, EntityKind, OperationId,
    PublicKey, Role,
};

/// Per (calendar, peer) access state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    NoAccess,
    Requested,
    Accepted,
    Rejected,
}

impl Display for AccessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            AccessState::NoAccess => "NoAccess",
            AccessState::Requested => "Requested",
            AccessState::Accepted => "Accepted",
            AccessState::Rejected => "Rejected",
        };
        write!(f, "{state}")
    }
}

/// Role of `public_key` in the calendar, if any.
///
/// The calendar author is always the owner. Everyone else has the role of
/// their user record.
pub async fn role_of<S: Store + ?Sized>(
    store: &S,
    calendar_id: &CalendarId,
    public_key: &PublicKey,
) -> Result<Option<Role>, StoreError> {
    if let Some(calendar) = store.entity(EntityKind::Calendar, calendar_id).await? {
        if calendar.author == *public_key {
            return Ok(Some(Role::Owner));
        }
    }
    Ok(store
        .user(calendar_id, public_key)
        .await?
        .map(|user| user.role))
}

/// `true` for the owner and admins of the calendar.
pub async fn can_manage<S: Store + ?Sized>(
    store: &S,
    calendar_id: &CalendarId,
    public_key: &PublicKey,
) -> Result<bool, StoreError> {
    Ok(role_of(store, calendar_id, public_key)
        .await?
        .is_some_and(|role| role.can_manage()))
}

/// A response only counts when its author manages the calendar.
async fn response_counts<S: Store + ?Sized>(
    store: &S,
    request: &AccessRequest,
    response: &AccessResponse,
) -> Result<bool, StoreError> {
    can_manage(store, &request.calendar_id, &response.from_public_key).await
}

/// Derive the access state of `public_key` for a calendar.
pub async fn access_state<S: Store + ?Sized>(
    store: &S,
    calendar_id: &CalendarId,
    public_key: &PublicKey,
) -> Result<AccessState, StoreError> {
    if role_of(store, calendar_id, public_key).await? == Some(Role::Owner) {
        return Ok(AccessState::Accepted);
    }

    let requests = store.access_requests(calendar_id, public_key).await?;
    if requests.is_empty() {
        return Ok(AccessState::NoAccess);
    }

    let mut rejected = false;
    for request in &requests {
        for response in store.access_responses(&request.id).await? {
            if !response_counts(store, request, &response).await? {
                continue;
            }
            if response.accept {
                return Ok(AccessState::Accepted);
            }
            rejected = true;
        }
    }

    Ok(if rejected {
        AccessState::Rejected
    } else {
        AccessState::Requested
    })
}

/// `true` if the peer owns the calendar or holds an accepted request.
pub async fn has_access<S: Store + ?Sized>(
    store: &S,
    calendar_id: &CalendarId,
    public_key: &PublicKey,
) -> Result<bool, StoreError> {
    Ok(access_state(store, calendar_id, public_key).await? == AccessState::Accepted)
}

// ─────────────────────────── Bookings ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Pending,
    Accepted,
    Rejected,
}

/// Status of a booking request: the latest (LWW) response that counts.
///
/// Responses count when they come from the author of the requested space or
/// resource, or from someone managing the calendar. Returns `None` when the
/// request has not been observed.
pub async fn booking_status<S: Store + ?Sized>(
    store: &S,
    request_id: &OperationId,
) -> Result<Option<BookingStatus>, CoreError> {
    let Some(request) = store.booking_request(request_id).await? else {
        return Ok(None);
    };

    let resource_author = match store.entity(EntityKind::Space, &request.resource_id).await? {
        Some(space) => Some(space.author),
        None => store
            .entity(EntityKind::Resource, &request.resource_id)
            .await?
            .map(|resource| resource.author),
    };

    let mut latest: Option<BookingResponse> = None;
    for response in store.booking_responses(request_id).await? {
        let counts = resource_author == Some(response.responder)
            || can_manage(store, &request.calendar_id, &response.responder).await?;
        if !counts {
            continue;
        }
        latest = match latest {
            Some(current) if !current.version.is_superseded_by(&response.version)? => {
                Some(current)
            }
            _ => Some(response),
        };
    }

    Ok(Some(match latest {
        None => BookingStatus::Pending,
        Some(response) if response.accept => BookingStatus::Accepted,
        Some(_) => BookingStatus::Rejected,
    }))
}
