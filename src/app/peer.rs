//! The per-peer context: store, node, pending completions, replay timers and
//! the invite code query, behind one command surface.
//!
//! Every command publishes an event and waits until the dispatcher has run it
//! through local processing, so a returned `Ok` means the local state already
//! reflects the change.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::correlation::{OperationError, PendingOperations};
use crate::app::error::PeerError;
use crate::app::invite::{invite_code, InviteCodes, ResolvedCalendar};
use crate::app::resolver::DependencyResolver;
use crate::config::Config;
use crate::core::{
    self, calendar_data_log, calendar_inbox_log, new_calendar_log, AccessRequested, AccessState,
    BookingRequested, BookingStatus, CalendarFields, CalendarId, CalendarScoped, Entity, EntityId,
    EntityKind, EntityRef, EntityUpdate, EventFields, EventPayload, OperationId, PublicKey,
    ResourceFields, ResponseRef, Role, RoleAssigned, SpaceFields, Store, SyncEffect, User,
};
use crate::ds::{Node, NodeError, StreamArgs, SubscriptionSet, Topic};

pub struct Peer<S: Store, N: Node> {
    pub(crate) store: Arc<S>,
    pub(crate) node: Arc<N>,
    public_key: PublicKey,
    config: Config,
    pub(crate) pending: PendingOperations,
    /// Held by a command from publish until its completion is registered, and
    /// by the dispatcher while it settles one.
    pub(crate) settle_gate: Mutex<()>,
    pub(crate) resolver: DependencyResolver<N>,
    pub(crate) invites: InviteCodes<S, N>,
    subscriptions: SubscriptionSet,
    cancel: CancellationToken,
}

impl<S: Store, N: Node> Peer<S, N> {
    /// Build the context and join the invite code rendezvous topic.
    pub async fn new(store: S, node: N, config: Config) -> Result<Self, PeerError> {
        let store = Arc::new(store);
        let node = Arc::new(node);
        node.subscribe_ephemeral(&Topic::InviteCodes).await?;

        let public_key = node.public_key();
        info!("[new]: peer {public_key} ready");
        Ok(Self {
            resolver: DependencyResolver::new(node.clone(), config.replay_debounce),
            invites: InviteCodes::new(store.clone(), node.clone(), config.clone()),
            pending: PendingOperations::new(),
            settle_gate: Mutex::new(()),
            subscriptions: SubscriptionSet::new(),
            cancel: CancellationToken::new(),
            public_key,
            config,
            store,
            node,
        })
    }

    /// Reject pending completions and the invite query, cancel replay timers
    /// and stop the dispatcher.
    pub fn shutdown(&self) {
        info!("[shutdown]: peer {} shutting down", self.public_key);
        self.cancel.cancel();
        self.pending.reject_all(OperationError::ShutDown);
        self.resolver.shutdown();
        self.invites.cancel();
    }

    /// Token cancelled by [`Peer::shutdown`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Topics this peer subscribed to, in no particular order.
    pub async fn subscriptions(&self) -> Vec<Topic> {
        self.subscriptions.snapshot().await
    }

    // ─────────────────────────── Calendars ───────────────────────────

    pub async fn create_calendar(&self, fields: CalendarFields) -> Result<CalendarId, PeerError> {
        let log_path = new_calendar_log();
        let calendar_id = self
            .publish_and_wait(
                EventPayload::CalendarCreated(fields),
                StreamArgs::default(),
                &log_path,
                None,
            )
            .await?;
        info!("[create_calendar]: created calendar {calendar_id}");
        Ok(calendar_id)
    }

    pub async fn update_calendar(
        &self,
        calendar_id: CalendarId,
        fields: CalendarFields,
    ) -> Result<(), PeerError> {
        self.require_calendar(&calendar_id).await?;
        self.publish_to_calendar(
            calendar_id,
            EventPayload::CalendarUpdated(EntityUpdate {
                id: calendar_id,
                fields,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_calendar(&self, calendar_id: CalendarId) -> Result<(), PeerError> {
        self.require_calendar(&calendar_id).await?;
        self.publish_to_calendar(
            calendar_id,
            EventPayload::CalendarDeleted(EntityRef { id: calendar_id }),
        )
        .await?;
        Ok(())
    }

    /// Invite code of a local calendar.
    pub async fn invite_code(&self, calendar_id: &CalendarId) -> Result<String, PeerError> {
        self.require_calendar(calendar_id).await?;
        Ok(invite_code(calendar_id, self.config.invite_code_len))
    }

    // ─────────────────────────── Spaces, resources, events ───────────────────────────

    pub async fn create_space(
        &self,
        calendar_id: CalendarId,
        fields: SpaceFields,
    ) -> Result<EntityId, PeerError> {
        self.require_calendar(&calendar_id).await?;
        self.publish_to_calendar(
            calendar_id,
            EventPayload::SpaceCreated(CalendarScoped {
                calendar_id,
                fields,
            }),
        )
        .await
    }

    pub async fn update_space(&self, id: EntityId, fields: SpaceFields) -> Result<(), PeerError> {
        let calendar_id = self.calendar_of(EntityKind::Space, &id).await?;
        self.publish_to_calendar(calendar_id, EventPayload::SpaceUpdated(EntityUpdate { id, fields }))
            .await?;
        Ok(())
    }

    pub async fn delete_space(&self, id: EntityId) -> Result<(), PeerError> {
        let calendar_id = self.calendar_of(EntityKind::Space, &id).await?;
        self.publish_to_calendar(calendar_id, EventPayload::SpaceDeleted(EntityRef { id }))
            .await?;
        Ok(())
    }

    pub async fn create_resource(
        &self,
        calendar_id: CalendarId,
        fields: ResourceFields,
    ) -> Result<EntityId, PeerError> {
        self.require_calendar(&calendar_id).await?;
        self.publish_to_calendar(
            calendar_id,
            EventPayload::ResourceCreated(CalendarScoped {
                calendar_id,
                fields,
            }),
        )
        .await
    }

    pub async fn update_resource(
        &self,
        id: EntityId,
        fields: ResourceFields,
    ) -> Result<(), PeerError> {
        let calendar_id = self.calendar_of(EntityKind::Resource, &id).await?;
        self.publish_to_calendar(
            calendar_id,
            EventPayload::ResourceUpdated(EntityUpdate { id, fields }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_resource(&self, id: EntityId) -> Result<(), PeerError> {
        let calendar_id = self.calendar_of(EntityKind::Resource, &id).await?;
        self.publish_to_calendar(calendar_id, EventPayload::ResourceDeleted(EntityRef { id }))
            .await?;
        Ok(())
    }

    pub async fn create_event(
        &self,
        calendar_id: CalendarId,
        fields: EventFields,
    ) -> Result<EntityId, PeerError> {
        self.require_calendar(&calendar_id).await?;
        self.publish_to_calendar(
            calendar_id,
            EventPayload::EventCreated(CalendarScoped {
                calendar_id,
                fields,
            }),
        )
        .await
    }

    pub async fn update_event(&self, id: EntityId, fields: EventFields) -> Result<(), PeerError> {
        let calendar_id = self.calendar_of(EntityKind::Event, &id).await?;
        self.publish_to_calendar(calendar_id, EventPayload::EventUpdated(EntityUpdate { id, fields }))
            .await?;
        Ok(())
    }

    pub async fn delete_event(&self, id: EntityId) -> Result<(), PeerError> {
        let calendar_id = self.calendar_of(EntityKind::Event, &id).await?;
        self.publish_to_calendar(calendar_id, EventPayload::EventDeleted(EntityRef { id }))
            .await?;
        Ok(())
    }

    // ─────────────────────────── Bookings ───────────────────────────

    /// Ask to book a space or resource for an event.
    pub async fn request_booking(
        &self,
        event_id: EntityId,
        resource_id: EntityId,
        message: Option<String>,
    ) -> Result<OperationId, PeerError> {
        let calendar_id = self.calendar_of(EntityKind::Event, &event_id).await?;
        self.publish_to_calendar(
            calendar_id,
            EventPayload::BookingRequested(BookingRequested {
                calendar_id,
                event_id,
                resource_id,
                message,
            }),
        )
        .await
    }

    pub async fn accept_booking(&self, request_id: OperationId) -> Result<(), PeerError> {
        self.respond_booking(request_id, true).await
    }

    pub async fn reject_booking(&self, request_id: OperationId) -> Result<(), PeerError> {
        self.respond_booking(request_id, false).await
    }

    async fn respond_booking(&self, request_id: OperationId, accept: bool) -> Result<(), PeerError> {
        let request = self
            .store
            .booking_request(&request_id)
            .await?
            .ok_or(PeerError::UnknownBookingRequest(request_id))?;
        let response = ResponseRef { request_id };
        let payload = if accept {
            EventPayload::BookingAccepted(response)
        } else {
            EventPayload::BookingRejected(response)
        };
        self.publish_to_calendar(request.calendar_id, payload).await?;
        Ok(())
    }

    pub async fn booking_status(
        &self,
        request_id: &OperationId,
    ) -> Result<Option<BookingStatus>, PeerError> {
        Ok(core::booking_status(self.store.as_ref(), request_id).await?)
    }

    // ─────────────────────────── Access ───────────────────────────

    /// Request access to a calendar that may not be known locally yet.
    ///
    /// Subscribes to the calendar inbox first so the response can arrive.
    pub async fn request_access(
        &self,
        calendar_id: CalendarId,
        name: Option<String>,
    ) -> Result<OperationId, PeerError> {
        self.subscribe(&Topic::CalendarInbox(calendar_id)).await?;
        let request_id = self
            .publish_to_inbox(
                calendar_id,
                EventPayload::CalendarAccessRequested(AccessRequested { calendar_id, name }),
            )
            .await?;
        info!("[request_access]: requested access to calendar {calendar_id}");
        Ok(request_id)
    }

    pub async fn accept_access(&self, request_id: OperationId) -> Result<(), PeerError> {
        self.respond_access(request_id, true).await
    }

    pub async fn reject_access(&self, request_id: OperationId) -> Result<(), PeerError> {
        self.respond_access(request_id, false).await
    }

    async fn respond_access(&self, request_id: OperationId, accept: bool) -> Result<(), PeerError> {
        let request = self
            .store
            .access_request(&request_id)
            .await?
            .ok_or(PeerError::UnknownAccessRequest(request_id))?;
        let response = ResponseRef { request_id };
        let payload = if accept {
            EventPayload::CalendarAccessAccepted(response)
        } else {
            EventPayload::CalendarAccessRejected(response)
        };
        self.publish_to_inbox(request.calendar_id, payload).await?;
        Ok(())
    }

    pub async fn access_state(
        &self,
        calendar_id: &CalendarId,
        public_key: &PublicKey,
    ) -> Result<AccessState, PeerError> {
        Ok(core::access_state(self.store.as_ref(), calendar_id, public_key).await?)
    }

    pub async fn has_access(
        &self,
        calendar_id: &CalendarId,
        public_key: &PublicKey,
    ) -> Result<bool, PeerError> {
        Ok(core::has_access(self.store.as_ref(), calendar_id, public_key).await?)
    }

    /// Access requests `public_key` made for a calendar.
    pub async fn access_requests(
        &self,
        calendar_id: &CalendarId,
        public_key: &PublicKey,
    ) -> Result<Vec<core::AccessRequest>, PeerError> {
        Ok(self.store.access_requests(calendar_id, public_key).await?)
    }

    pub async fn assign_role(
        &self,
        calendar_id: CalendarId,
        public_key: PublicKey,
        role: Role,
    ) -> Result<(), PeerError> {
        self.require_calendar(&calendar_id).await?;
        self.publish_to_calendar(
            calendar_id,
            EventPayload::UserRoleAssigned(RoleAssigned {
                calendar_id,
                public_key,
                role,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn users(&self, calendar_id: &CalendarId) -> Result<Vec<User>, PeerError> {
        Ok(self.store.users(calendar_id).await?)
    }

    // ─────────────────────────── Invite codes ───────────────────────────

    pub async fn resolve_invite_code(&self, code: &str) -> Result<ResolvedCalendar, PeerError> {
        Ok(self.invites.resolve(code).await?)
    }

    /// Resolve an invite code and request access to the calendar behind it.
    pub async fn join_with_invite_code(
        &self,
        code: &str,
        name: Option<String>,
    ) -> Result<(ResolvedCalendar, OperationId), PeerError> {
        let calendar = self.resolve_invite_code(code).await?;
        let request_id = self.request_access(calendar.calendar_id, name).await?;
        Ok((calendar, request_id))
    }

    // ─────────────────────────── Queries ───────────────────────────

    pub async fn calendar(&self, calendar_id: &CalendarId) -> Result<Option<Entity>, PeerError> {
        Ok(self.store.entity(EntityKind::Calendar, calendar_id).await?)
    }

    pub async fn entity(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>, PeerError> {
        Ok(self.store.entity(kind, id).await?)
    }

    pub async fn entities(
        &self,
        kind: EntityKind,
        calendar_id: &CalendarId,
    ) -> Result<Vec<Entity>, PeerError> {
        Ok(self.store.entities(kind, calendar_id).await?)
    }

    // ─────────────────────────── Internals ───────────────────────────

    /// Carry out the sync effects returned by event processing.
    pub(crate) async fn apply_effects(&self, effects: &[SyncEffect]) -> Result<(), NodeError> {
        for effect in effects {
            match effect {
                SyncEffect::AddLogToTopic {
                    public_key,
                    topic,
                    log_id,
                } => {
                    debug!("[apply_effects]: sync {log_id} of {public_key} on {topic}");
                    self.node.add_log_to_topic(public_key, topic, log_id).await?;
                }
                SyncEffect::Subscribe(topic) => self.subscribe(topic).await?,
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), NodeError> {
        if !self.subscriptions.insert(topic.clone()).await {
            return Ok(());
        }
        info!("[subscribe]: subscribing to {topic}");
        if let Err(e) = self.node.subscribe(topic).await {
            self.subscriptions.remove(topic).await;
            return Err(e);
        }
        Ok(())
    }

    async fn require_calendar(&self, calendar_id: &CalendarId) -> Result<(), PeerError> {
        match self.store.entity(EntityKind::Calendar, calendar_id).await? {
            Some(_) => Ok(()),
            None => Err(PeerError::UnknownCalendar(*calendar_id)),
        }
    }

    async fn calendar_of(&self, kind: EntityKind, id: &EntityId) -> Result<CalendarId, PeerError> {
        self.store
            .entity(kind, id)
            .await?
            .map(|entity| entity.calendar_id)
            .ok_or(PeerError::UnknownEntity(kind, *id))
    }

    async fn publish_to_calendar(
        &self,
        calendar_id: CalendarId,
        payload: EventPayload,
    ) -> Result<OperationId, PeerError> {
        self.publish_and_wait(
            payload,
            StreamArgs {
                root: Some(calendar_id),
                owner: None,
            },
            &calendar_data_log(&calendar_id),
            Some(Topic::CalendarData(calendar_id)),
        )
        .await
    }

    async fn publish_to_inbox(
        &self,
        calendar_id: CalendarId,
        payload: EventPayload,
    ) -> Result<OperationId, PeerError> {
        self.publish_and_wait(
            payload,
            StreamArgs {
                root: Some(calendar_id),
                owner: None,
            },
            &calendar_inbox_log(&calendar_id),
            Some(Topic::CalendarInbox(calendar_id)),
        )
        .await
    }

    /// Publish and wait for local processing of the event.
    ///
    /// The node may hand the event to the dispatcher before `publish`
    /// returns. The settle gate keeps the dispatcher from settling it until
    /// the completion is registered.
    async fn publish_and_wait(
        &self,
        payload: EventPayload,
        stream: StreamArgs,
        log_path: &str,
        topic: Option<Topic>,
    ) -> Result<OperationId, PeerError> {
        let event_type = payload.event_type();
        let completion = {
            let _gate = self.settle_gate.lock().await;
            let (operation_id, _) = self
                .node
                .publish(&payload, stream, log_path, topic.as_ref())
                .await?;
            self.pending.register(operation_id)?
        };
        let operation_id = *completion.operation_id();
        debug!("[publish_and_wait]: {event_type} {operation_id} published, waiting");
        completion.wait().await?;
        Ok(operation_id)
    }
}
