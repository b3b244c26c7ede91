//! Correlation between locally issued operations and their eventual outcome.
//!
//! A command publishes an event, registers the returned operation id here
//! and awaits the [`Completion`]. The dispatcher settles it once the event
//! has gone through local processing.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::core::OperationId;

/// Why a pending operation did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("Operation rejected: {0}")]
    Rejected(String),
    #[error("Peer shut down before the operation settled")]
    ShutDown,
    #[error("Operation {0} already has a pending completion")]
    AlreadyPending(OperationId),
}

type Outcome = Result<(), OperationError>;

/// Receiving half of a registered operation.
#[derive(Debug)]
pub struct Completion {
    operation_id: OperationId,
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    /// Wait for settlement. There is no timeout.
    pub async fn wait(self) -> Result<(), OperationError> {
        self.rx.await.unwrap_or(Err(OperationError::ShutDown))
    }
}

/// Outstanding completions keyed by operation id.
///
/// The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct PendingOperations {
    inner: Mutex<HashMap<OperationId, oneshot::Sender<Outcome>>>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completion for `operation_id`.
    ///
    /// Refused while another completion for the same id is pending.
    pub fn register(&self, operation_id: OperationId) -> Result<Completion, OperationError> {
        let mut pending = self.lock();
        if pending
            .get(&operation_id)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(OperationError::AlreadyPending(operation_id));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(operation_id, tx);
        Ok(Completion { operation_id, rx })
    }

    /// Complete successfully. Unknown or already settled ids are ignored.
    pub fn resolve(&self, operation_id: &OperationId) {
        self.settle(operation_id, Ok(()));
    }

    /// Complete with an error. Unknown or already settled ids are ignored.
    pub fn reject(&self, operation_id: &OperationId, error: OperationError) {
        self.settle(operation_id, Err(error));
    }

    /// Reject every pending operation, used on shutdown.
    pub fn reject_all(&self, error: OperationError) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (operation_id, tx) in drained {
            debug!("[reject_all]: {operation_id} → {error}");
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn is_pending(&self, operation_id: &OperationId) -> bool {
        self.lock().contains_key(operation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle(&self, operation_id: &OperationId, outcome: Outcome) {
        let Some(tx) = self.lock().remove(operation_id) else {
            return;
        };
        debug!("[settle]: {operation_id} → {outcome:?}");
        // The issuer may have stopped waiting.
        let _ = tx.send(outcome);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OperationId, oneshot::Sender<Outcome>>> {
        // A poisoned map only means a panic elsewhere; the entries are still valid.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
