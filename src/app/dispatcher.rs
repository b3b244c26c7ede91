//! Inbound message routing.
//!
//! [`Peer::dispatch`] handles one message; [`spawn_dispatcher`] runs it over
//! the node's inbound channel until cancelled. A failing message is logged and
//! never blocks the ones after it.

use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::correlation::OperationError;
use crate::app::error::PeerError;
use crate::app::peer::Peer;
use crate::core::{apply_event, ApplicationEvent, ProcessError, ProcessResult, Store};
use crate::ds::{InboundMessage, Node, SystemEvent, Topic};

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Application event acknowledged; it will not be redelivered.
    Acknowledged,
    /// Application event left unacknowledged for redelivery.
    Withheld,
    /// Invite code or system message, nothing to acknowledge.
    Handled,
}

impl<S: Store, N: Node> Peer<S, N> {
    /// Route one inbound message.
    ///
    /// Application events are acknowledged after a success or a permanent
    /// rejection. A missing prerequisite or a failed sync effect schedules a
    /// replay of the event's topic and leaves the event unacknowledged; store
    /// failures are returned as errors, also unacknowledged.
    pub async fn dispatch(&self, message: InboundMessage) -> Result<Delivery, PeerError> {
        match message {
            InboundMessage::Application { topic, event } => {
                self.dispatch_event(topic, &event).await
            }
            InboundMessage::InviteCode(message) => {
                self.invites.handle_message(message).await?;
                Ok(Delivery::Handled)
            }
            InboundMessage::System(event) => {
                match event {
                    SystemEvent::Ready => info!("[dispatch]: node ready"),
                    SystemEvent::Subscribed(topic) => debug!("[dispatch]: subscribed to {topic}"),
                    SystemEvent::PeerCountChanged(count) => {
                        debug!("[dispatch]: {count} peers connected")
                    }
                }
                Ok(Delivery::Handled)
            }
        }
    }

    async fn dispatch_event(
        &self,
        topic: Option<Topic>,
        event: &ApplicationEvent,
    ) -> Result<Delivery, PeerError> {
        let operation_id = *event.operation_id();
        match apply_event(self.store.as_ref(), &self.public_key(), event).await {
            Ok(result) => {
                if let ProcessResult::Applied(effects) = &result {
                    if let Err(e) = self.apply_effects(effects).await {
                        error!("[dispatch]: sync effects of {operation_id} failed: {e}");
                        self.retry_later(topic, event, &e);
                        return Ok(Delivery::Withheld);
                    }
                    self.store.mark_processed(&operation_id).await?;
                }
                self.node.ack(&operation_id).await?;
                let _gate = self.settle_gate.lock().await;
                self.pending.resolve(&operation_id);
                Ok(Delivery::Acknowledged)
            }
            Err(err) if err.is_permanent() => {
                if let ProcessError::Conflict(conflict) = &err {
                    error!("[dispatch]: {} {operation_id}: {conflict}", event.payload);
                }
                self.node.ack(&operation_id).await?;
                let _gate = self.settle_gate.lock().await;
                self.pending
                    .reject(&operation_id, OperationError::Rejected(err.to_string()));
                Ok(Delivery::Acknowledged)
            }
            Err(ProcessError::MissingDependency(dependency)) => {
                self.retry_later(topic, event, &dependency);
                Ok(Delivery::Withheld)
            }
            Err(ProcessError::Store(e)) => Err(PeerError::Store(e)),
            Err(err) => Err(PeerError::Core(err.into())),
        }
    }

    /// Leave the event unacknowledged and ask for a replay of its topic.
    fn retry_later(&self, topic: Option<Topic>, event: &ApplicationEvent, reason: &dyn Display) {
        let operation_id = event.operation_id();
        match topic {
            Some(topic) => {
                debug!(
                    "[dispatch]: {} {operation_id} withheld ({reason}), replaying {topic}",
                    event.payload
                );
                self.resolver.trigger(topic);
            }
            None => warn!(
                "[dispatch]: {} {operation_id} withheld ({reason}) but has no topic to replay",
                event.payload
            ),
        }
    }
}

/// Run the dispatch loop until `cancel` fires or the channel closes.
pub fn spawn_dispatcher<S: Store, N: Node>(
    peer: Arc<Peer<S, N>>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("[dispatcher]: started for {}", peer.public_key());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = inbound.recv() => {
                    let Some(message) = maybe else {
                        break;
                    };
                    if let Err(e) = peer.dispatch(message).await {
                        error!("[dispatcher]: failed to handle message: {e}");
                    }
                }
            }
        }
        info!("[dispatcher]: stopped for {}", peer.public_key());
    })
}
