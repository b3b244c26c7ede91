//! Invite code rendezvous over the ephemeral invite topic.
//!
//! An invite code is the leading hex characters of a calendar id. A peer
//! that does not know the calendar broadcasts a request every retry interval
//! until a peer that knows it answers, or the deadline passes.
//!
//! ```text
//! t=0s   request ──►
//! t=5s   request ──►
//!   ...             ◄── response {code, calendarId, calendarName}
//! t=30s  timeout (no response)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{CalendarId, Entity, InviteCodeMessage, Store, StoreError};
use crate::ds::{Node, NodeError, Topic};

#[derive(Debug, thiserror::Error)]
pub enum InviteCodeError {
    #[error("Invalid invite code {0:?}: expected {1} hex characters")]
    InvalidCode(String, usize),
    #[error("No peer answered for invite code {0}")]
    Timeout(String),
    #[error("Invite code query superseded by a newer one")]
    Superseded,
    #[error("Invite code query cancelled")]
    Cancelled,

    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A calendar found through its invite code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCalendar {
    pub calendar_id: CalendarId,
    pub name: String,
}

impl From<&Entity> for ResolvedCalendar {
    fn from(calendar: &Entity) -> Self {
        Self {
            calendar_id: calendar.id,
            name: calendar.name().to_string(),
        }
    }
}

/// Invite code of a calendar.
pub fn invite_code(calendar_id: &CalendarId, len: usize) -> String {
    let mut code = calendar_id.to_hex();
    code.truncate(len);
    code
}

type Reply = Result<ResolvedCalendar, InviteCodeError>;

struct PendingQuery {
    seq: u64,
    code: String,
    tx: oneshot::Sender<Reply>,
}

/// The one live invite code query of a peer, plus the responder side.
pub struct InviteCodes<S: Store, N: Node> {
    store: Arc<S>,
    node: Arc<N>,
    config: Config,
    pending: Mutex<Option<PendingQuery>>,
    next_seq: AtomicU64,
}

/// Clears the pending slot when the resolving future finishes or is dropped.
struct SlotGuard<'a> {
    slot: &'a Mutex<Option<PendingQuery>>,
    seq: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().is_some_and(|query| query.seq == self.seq) {
            *slot = None;
        }
    }
}

impl<S: Store, N: Node> InviteCodes<S, N> {
    pub fn new(store: Arc<S>, node: Arc<N>, config: Config) -> Self {
        Self {
            store,
            node,
            config,
            pending: Mutex::new(None),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Resolve an invite code to a calendar.
    ///
    /// Codes of locally known calendars resolve without touching the network.
    /// Starting a query while another is pending rejects the older one with
    /// [`InviteCodeError::Superseded`].
    pub async fn resolve(&self, code: &str) -> Result<ResolvedCalendar, InviteCodeError> {
        let code = self.normalize(code)?;
        if let Some(calendar) = self.store.calendar_by_prefix(&code).await? {
            debug!("[resolve]: invite code {code} is a local calendar");
            return Ok(ResolvedCalendar::from(&calendar));
        }

        let (tx, mut rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = lock(&self.pending);
            if let Some(previous) = slot.replace(PendingQuery {
                seq,
                code: code.clone(),
                tx,
            }) {
                info!("[resolve]: invite code {} superseded by {code}", previous.code);
                let _ = previous.tx.send(Err(InviteCodeError::Superseded));
            }
        }
        let _guard = SlotGuard {
            slot: &self.pending,
            seq,
        };

        let request = serde_json::to_vec(&InviteCodeMessage::Request {
            code: code.clone(),
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        })?;
        let deadline = Instant::now() + self.config.invite_timeout;
        let mut retry = tokio::time::interval(self.config.invite_retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                reply = &mut rx => {
                    return reply.unwrap_or(Err(InviteCodeError::Cancelled));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("[resolve]: invite code {code} timed out");
                    return Err(InviteCodeError::Timeout(code));
                }
                _ = retry.tick() => {
                    debug!("[resolve]: broadcasting request for invite code {code}");
                    if let Err(e) = self
                        .node
                        .broadcast_ephemeral(&Topic::InviteCodes, request.clone())
                        .await
                    {
                        warn!("[resolve]: broadcast for {code} failed: {e}");
                    }
                }
            }
        }
    }

    /// Handle an inbound invite code message.
    ///
    /// Requests for a local calendar get one response. Responses settle the
    /// pending query if the code and calendar id match.
    pub async fn handle_message(&self, message: InviteCodeMessage) -> Result<(), InviteCodeError> {
        match message {
            InviteCodeMessage::Request { code, .. } => {
                if code.len() != self.config.invite_code_len {
                    return Ok(());
                }
                let Some(calendar) = self.store.calendar_by_prefix(&code).await? else {
                    return Ok(());
                };
                info!("[handle_message]: answering invite code {code}");
                let response = serde_json::to_vec(&InviteCodeMessage::Response {
                    code,
                    calendar_id: calendar.id,
                    calendar_name: calendar.name().to_string(),
                })?;
                self.node
                    .broadcast_ephemeral(&Topic::InviteCodes, response)
                    .await?;
            }
            InviteCodeMessage::Response {
                code,
                calendar_id,
                calendar_name,
            } => {
                let mut slot = lock(&self.pending);
                let matches = slot.as_ref().is_some_and(|query| {
                    query.code == code && calendar_id.to_hex().starts_with(&query.code)
                });
                if !matches {
                    debug!("[handle_message]: ignoring response for invite code {code}");
                    return Ok(());
                }
                if let Some(query) = slot.take() {
                    info!("[handle_message]: invite code {code} resolved to {calendar_id}");
                    let _ = query.tx.send(Ok(ResolvedCalendar {
                        calendar_id,
                        name: calendar_name,
                    }));
                }
            }
        }
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Reject the pending query, if any.
    pub fn cancel(&self) {
        if let Some(query) = lock(&self.pending).take() {
            let _ = query.tx.send(Err(InviteCodeError::Cancelled));
        }
    }

    fn normalize(&self, code: &str) -> Result<String, InviteCodeError> {
        let code = code.trim().to_ascii_lowercase();
        let valid = code.len() == self.config.invite_code_len
            && code.chars().all(|c| c.is_ascii_hexdigit());
        if valid {
            Ok(code)
        } else {
            Err(InviteCodeError::InvalidCode(
                code,
                self.config.invite_code_len,
            ))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
