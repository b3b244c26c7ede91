use crate::app::correlation::OperationError;
use crate::app::invite::InviteCodeError;
use crate::core::{CalendarId, CoreError, EntityId, EntityKind, OperationId, StoreError};
use crate::ds::NodeError;

/// Errors returned by [`Peer`](crate::app::Peer) commands and the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Unknown calendar: {0}")]
    UnknownCalendar(CalendarId),
    #[error("Unknown {0}: {1}")]
    UnknownEntity(EntityKind, EntityId),
    #[error("Unknown access request: {0}")]
    UnknownAccessRequest(OperationId),
    #[error("Unknown booking request: {0}")]
    UnknownBookingRequest(OperationId),

    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    InviteCode(#[from] InviteCodeError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Core(#[from] CoreError),
}
