//! In-process transport: a hub that every [`MemoryNode`] joins.
//!
//! The hub keeps per-author logs, maps logs to topics, syncs a topic's
//! history on subscribe and redelivers unacknowledged events on replay.
//! Each node records the calls made on it, which is what tests assert on.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::core::{
    ApplicationEvent, EventMeta, EventPayload, Hash, InviteCodeMessage, OperationId, PublicKey,
    StreamId,
};
use crate::ds::{InboundMessage, Node, NodeError, StreamArgs, SystemEvent, Topic};

/// A call made on a [`MemoryNode`], in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCall {
    Publish {
        operation_id: OperationId,
        log_path: String,
        topic: Option<Topic>,
    },
    Subscribe(Topic),
    SubscribeEphemeral(Topic),
    Broadcast {
        topic: Topic,
        message: InviteCodeMessage,
        at: Instant,
    },
    AddLogToTopic {
        public_key: PublicKey,
        topic: Topic,
        log_id: String,
    },
    Replay {
        topic: Topic,
        at: Instant,
    },
    Ack(OperationId),
}

type LogKey = (PublicKey, String);

struct PeerSlot {
    tx: mpsc::UnboundedSender<InboundMessage>,
    topics: HashSet<Topic>,
    ephemeral: HashSet<Topic>,
    acked: HashSet<OperationId>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<PublicKey, PeerSlot>,
    logs: HashMap<LogKey, Vec<ApplicationEvent>>,
    topic_logs: HashMap<Topic, HashSet<LogKey>>,
    clock: u64,
}

impl HubState {
    /// Send every unacked event of the topic's logs to one peer.
    fn sync_topic(&self, peer: &PublicKey, topic: &Topic) {
        let Some(slot) = self.peers.get(peer) else {
            return;
        };
        let Some(keys) = self.topic_logs.get(topic) else {
            return;
        };
        for key in keys {
            for event in self.logs.get(key).into_iter().flatten() {
                if slot.acked.contains(event.operation_id()) {
                    continue;
                }
                let _ = slot.tx.send(InboundMessage::Application {
                    topic: Some(topic.clone()),
                    event: event.clone(),
                });
            }
        }
    }

    fn next_timestamp(&mut self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        self.clock = now.max(self.clock + 1);
        self.clock
    }
}

/// Shared medium connecting in-process nodes. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer. Returns its node and the inbound channel for its dispatcher.
    pub fn join(&self, public_key: PublicKey) -> (MemoryNode, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(InboundMessage::System(SystemEvent::Ready));
        if let Ok(mut state) = self.state.lock() {
            state.peers.insert(
                public_key,
                PeerSlot {
                    tx,
                    topics: HashSet::new(),
                    ephemeral: HashSet::new(),
                    acked: HashSet::new(),
                },
            );
        }
        let node = MemoryNode {
            public_key,
            hub: self.clone(),
            calls: Arc::new(Mutex::new(Vec::new())),
        };
        (node, rx)
    }

    /// Detach a peer. Calls from its node that need its slot then fail with
    /// [`NodeError::ShutDown`].
    pub fn leave(&self, public_key: &PublicKey) {
        if let Ok(mut state) = self.state.lock() {
            state.peers.remove(public_key);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>, NodeError> {
        self.state
            .lock()
            .map_err(|_| NodeError::Other(anyhow::anyhow!("memory hub lock poisoned")))
    }
}

/// A peer's handle on a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryNode {
    public_key: PublicKey,
    hub: MemoryHub,
    calls: Arc<Mutex<Vec<NodeCall>>>,
}

impl MemoryNode {
    fn record(&self, call: NodeCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn acks(&self) -> Vec<OperationId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NodeCall::Ack(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn replays(&self) -> Vec<(Topic, Instant)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NodeCall::Replay { topic, at } => Some((topic, at)),
                _ => None,
            })
            .collect()
    }

    pub fn broadcasts(&self) -> Vec<(InviteCodeMessage, Instant)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NodeCall::Broadcast { message, at, .. } => Some((message, at)),
                _ => None,
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<Topic> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NodeCall::Subscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }
}

fn operation_hash(
    author: &PublicKey,
    log_path: &str,
    seq: usize,
    timestamp: u64,
    payload: &[u8],
) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(author.as_bytes());
    hasher.update(log_path.as_bytes());
    hasher.update((seq as u64).to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(payload);
    Hash::from_bytes(hasher.finalize().into())
}

fn stream_hash(owner: &PublicKey, log_path: &str) -> StreamId {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_bytes());
    hasher.update(log_path.as_bytes());
    Hash::from_bytes(hasher.finalize().into())
}

#[async_trait]
impl Node for MemoryNode {
    async fn publish(
        &self,
        payload: &EventPayload,
        stream: StreamArgs,
        log_path: &str,
        topic: Option<&Topic>,
    ) -> Result<(OperationId, StreamId), NodeError> {
        let bytes = serde_json::to_vec(payload)?;
        let mut state = self.hub.lock()?;
        if !state.peers.contains_key(&self.public_key) {
            return Err(NodeError::ShutDown);
        }

        let key: LogKey = (self.public_key, log_path.to_string());
        let seq = state.logs.get(&key).map_or(0, Vec::len);
        let timestamp = state.next_timestamp();
        let operation_id = operation_hash(&self.public_key, log_path, seq, timestamp, &bytes);
        let stream_id = match stream.root {
            Some(root) => root,
            None => stream_hash(&stream.owner.unwrap_or(self.public_key), log_path),
        };

        let event = ApplicationEvent {
            payload: payload.clone(),
            meta: EventMeta {
                operation_id,
                author: self.public_key,
                stream_id,
                log_path: log_path.to_string(),
                timestamp,
            },
        };
        state.logs.entry(key.clone()).or_default().push(event.clone());
        if let Some(topic) = topic {
            state
                .topic_logs
                .entry(topic.clone())
                .or_default()
                .insert(key.clone());
        }

        // Subscribers of any topic carrying this log, and always the author.
        let mut recipients: HashMap<PublicKey, Option<Topic>> = HashMap::new();
        recipients.insert(self.public_key, topic.cloned());
        for (t, keys) in &state.topic_logs {
            if !keys.contains(&key) {
                continue;
            }
            for (peer, slot) in &state.peers {
                if slot.topics.contains(t) && *peer != self.public_key {
                    recipients.insert(*peer, Some(t.clone()));
                }
            }
        }
        for (peer, t) in recipients {
            if let Some(slot) = state.peers.get(&peer) {
                let _ = slot.tx.send(InboundMessage::Application {
                    topic: t,
                    event: event.clone(),
                });
            }
        }
        drop(state);

        debug!("[publish]: {payload} {operation_id} on {log_path}");
        self.record(NodeCall::Publish {
            operation_id,
            log_path: log_path.to_string(),
            topic: topic.cloned(),
        });
        Ok((operation_id, stream_id))
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), NodeError> {
        let mut state = self.hub.lock()?;
        let slot = state
            .peers
            .get_mut(&self.public_key)
            .ok_or(NodeError::ShutDown)?;
        slot.topics.insert(topic.clone());
        let _ = slot
            .tx
            .send(InboundMessage::System(SystemEvent::Subscribed(topic.clone())));
        state.sync_topic(&self.public_key, topic);
        drop(state);

        self.record(NodeCall::Subscribe(topic.clone()));
        Ok(())
    }

    async fn subscribe_ephemeral(&self, topic: &Topic) -> Result<(), NodeError> {
        let mut state = self.hub.lock()?;
        let slot = state
            .peers
            .get_mut(&self.public_key)
            .ok_or(NodeError::ShutDown)?;
        slot.ephemeral.insert(topic.clone());
        drop(state);

        self.record(NodeCall::SubscribeEphemeral(topic.clone()));
        Ok(())
    }

    async fn broadcast_ephemeral(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), NodeError> {
        let message: InviteCodeMessage = serde_json::from_slice(&payload)?;
        let state = self.hub.lock()?;
        for (peer, slot) in &state.peers {
            if *peer != self.public_key && slot.ephemeral.contains(topic) {
                let _ = slot.tx.send(InboundMessage::InviteCode(message.clone()));
            }
        }
        drop(state);

        self.record(NodeCall::Broadcast {
            topic: topic.clone(),
            message,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn add_log_to_topic(
        &self,
        public_key: &PublicKey,
        topic: &Topic,
        log_id: &str,
    ) -> Result<(), NodeError> {
        let mut state = self.hub.lock()?;
        let added = state
            .topic_logs
            .entry(topic.clone())
            .or_default()
            .insert((*public_key, log_id.to_string()));
        if added {
            let subscribers: Vec<PublicKey> = state
                .peers
                .iter()
                .filter(|(_, slot)| slot.topics.contains(topic))
                .map(|(peer, _)| *peer)
                .collect();
            for peer in subscribers {
                state.sync_topic(&peer, topic);
            }
        }
        drop(state);

        self.record(NodeCall::AddLogToTopic {
            public_key: *public_key,
            topic: topic.clone(),
            log_id: log_id.to_string(),
        });
        Ok(())
    }

    async fn replay(&self, topic: &Topic) -> Result<(), NodeError> {
        let state = self.hub.lock()?;
        state.sync_topic(&self.public_key, topic);
        drop(state);

        self.record(NodeCall::Replay {
            topic: topic.clone(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn ack(&self, operation_id: &OperationId) -> Result<(), NodeError> {
        let mut state = self.hub.lock()?;
        let slot = state
            .peers
            .get_mut(&self.public_key)
            .ok_or(NodeError::ShutDown)?;
        slot.acked.insert(*operation_id);
        drop(state);

        self.record(NodeCall::Ack(*operation_id));
        Ok(())
    }

    fn public_key(&self) -> PublicKey {
        self.public_key
    }
}
