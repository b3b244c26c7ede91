//! Node interface and the inbound message envelope.
use async_trait::async_trait;

use crate::core::{ApplicationEvent, EventPayload, InviteCodeMessage, OperationId, PublicKey, StreamId};
use crate::ds::{NodeError, Topic};

/// Stream placement for a published event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamArgs {
    /// Root operation of an existing stream, `None` to start a new one.
    pub root: Option<OperationId>,
    /// Owner of the stream, defaults to the publishing peer.
    pub owner: Option<PublicKey>,
}

/// Status notifications from the node, not tied to application state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    Ready,
    Subscribed(Topic),
    PeerCountChanged(usize),
}

/// Everything the node delivers to the dispatcher.
///
/// Application events are delivered at least once and in no particular order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Application {
        topic: Option<Topic>,
        event: ApplicationEvent,
    },
    InviteCode(InviteCodeMessage),
    System(SystemEvent),
}

/// The backend node: signing, persistence of logs, gossip and sync.
///
/// All calls are opaque remote calls and may fail; the core treats every
/// failure as retryable.
#[async_trait]
pub trait Node: Send + Sync + 'static {
    /// Sign and append an event to `log_path`, then gossip it on `topic`
    /// (local only when `None`).
    async fn publish(
        &self,
        payload: &EventPayload,
        stream: StreamArgs,
        log_path: &str,
        topic: Option<&Topic>,
    ) -> Result<(OperationId, StreamId), NodeError>;

    async fn subscribe(&self, topic: &Topic) -> Result<(), NodeError>;

    /// Subscribe to messages that are gossiped but never persisted.
    async fn subscribe_ephemeral(&self, topic: &Topic) -> Result<(), NodeError>;

    /// Fire-and-forget ephemeral broadcast.
    async fn broadcast_ephemeral(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), NodeError>;

    /// Sync `log_id` of `public_key` whenever `topic` is synced.
    async fn add_log_to_topic(
        &self,
        public_key: &PublicKey,
        topic: &Topic,
        log_id: &str,
    ) -> Result<(), NodeError>;

    /// Redeliver unacknowledged events of a topic.
    async fn replay(&self, topic: &Topic) -> Result<(), NodeError>;

    /// Stop redelivery of an event.
    async fn ack(&self, operation_id: &OperationId) -> Result<(), NodeError>;

    fn public_key(&self) -> PublicKey;
}
