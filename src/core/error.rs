//! Core library errors.

use std::fmt::Display;
use thiserror::Error;

use crate::core::lww::LwwError;
use crate::core::types::{CalendarId, EntityId, EntityKind, OperationId};

/// Errors reported by a [`Store`](crate::core::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not complete the call. Retryable.
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A causal prerequisite that has not been observed locally yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    Calendar(CalendarId),
    Entity { kind: EntityKind, id: EntityId },
    BookingRequest(OperationId),
}

impl Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dependency::Calendar(id) => write!(f, "calendar {id}"),
            Dependency::Entity { kind, id } => write!(f, "{kind} {id}"),
            Dependency::BookingRequest(id) => write!(f, "booking request {id}"),
        }
    }
}

/// Why an application event could not be applied.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Unauthorized or invalid mutation. Acknowledged, never retried.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Prerequisite missing. Not acknowledged, replay requested.
    #[error("Missing dependency: {0}")]
    MissingDependency(Dependency),

    /// Two distinct writes share an LWW position. Acknowledged, never retried.
    #[error("Conflicting versions: {0}")]
    Conflict(#[from] LwwError),

    /// Store failure. Not acknowledged, the transport redelivers.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ProcessError {
    /// Permanent failures are acknowledged so the transport stops redelivering.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProcessError::Rejected(_) | ProcessError::Conflict(_))
    }
}

/// Errors that can occur in the core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Conflict(#[from] LwwError),
}
