//! Idempotent application of [`ApplicationEvent`]s to the local store.
//!
//! [`process_event`] never talks to the network. It returns the sync effects
//! (log registrations, subscriptions) the caller has to carry out, the same
//! way inbound processing returns a result for the app layer to dispatch.
//!
//! # Handler outline
//!
//! ```text
//! already processed?            → Duplicate
//! prerequisite missing?         → Err(MissingDependency)   (not acked, replay)
//! prerequisite deleted?         → Stale                    (acked, no-op)
//! author not allowed?           → Err(Rejected)            (acked, held)
//! otherwise                     → upsert, Applied(effects)
//! ```
//!
//! Updates, deletions and role assignments rejected because the author did
//! not manage the calendar yet are held in the store. When a role assignment
//! makes that author an owner or admin, the held mutations are applied again
//! in `(timestamp, operation id)` order, so the result does not depend on
//! whether the promotion arrived first.

use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, warn};

use crate::core::access::can_manage;
use crate::core::error::{Dependency, ProcessError, StoreError};
use crate::core::events::{
    calendar_data_log, AccessRequested, ApplicationEvent, BookingRequested, CalendarScoped,
    EntityUpdate, EventPayload, RoleAssigned,
};
use crate::core::store::Store;
use crate::core::types::{
    AccessRequest, AccessResponse, BookingRequest, BookingResponse, CalendarId, Entity, EntityFields,
    EntityId, EntityKind, OperationId, PublicKey, Role, User, Version,
};
use crate::ds::Topic;

/// Network side effect requested by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEffect {
    /// Sync `log_id` of `public_key` as part of `topic`.
    AddLogToTopic {
        public_key: PublicKey,
        topic: Topic,
        log_id: String,
    },
    /// Subscribe this peer to `topic`.
    Subscribe(Topic),
}

/// Result of processing one application event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// State changed; carry out the effects.
    Applied(Vec<SyncEffect>),
    /// The operation was processed before.
    Duplicate,
    /// Nothing to do: target deleted, or an update lost the LWW order.
    Stale,
}

impl ProcessResult {
    pub fn effects(&self) -> &[SyncEffect] {
        match self {
            ProcessResult::Applied(effects) => effects,
            _ => &[],
        }
    }
}

/// Apply one event. See the module docs for the outcome of each check.
///
/// Both successes and permanent rejections are recorded as processed, so a
/// redelivery resolves to [`ProcessResult::Duplicate`] and decisions never flip.
pub async fn process_event<S: Store + ?Sized>(
    store: &S,
    local: &PublicKey,
    event: &ApplicationEvent,
) -> Result<ProcessResult, ProcessError> {
    let result = apply_event(store, local, event).await?;
    if let ProcessResult::Applied(_) = &result {
        store.mark_processed(event.operation_id()).await?;
    }
    Ok(result)
}

/// Like [`process_event`], except that an [`ProcessResult::Applied`] outcome
/// is not recorded as processed.
///
/// The caller marks it with [`Store::mark_processed`] once the effects are
/// carried out. Until then a redelivery applies the event again, which is a
/// no-op for the store and returns the same effects.
pub async fn apply_event<S: Store + ?Sized>(
    store: &S,
    local: &PublicKey,
    event: &ApplicationEvent,
) -> Result<ProcessResult, ProcessError> {
    let operation_id = event.operation_id();
    if store.is_processed(operation_id).await? {
        debug!("[process_event]: {operation_id} already processed");
        return Ok(ProcessResult::Duplicate);
    }

    let result = apply(store, local, event).await;
    match &result {
        Ok(ProcessResult::Applied(_)) => {
            info!(
                "[process_event]: {} {operation_id} from {} applied",
                event.payload,
                event.author()
            );
        }
        Ok(outcome) => {
            info!(
                "[process_event]: {} {operation_id} from {} → {outcome:?}",
                event.payload,
                event.author()
            );
            store.mark_processed(operation_id).await?;
        }
        Err(err) if err.is_permanent() => {
            warn!("[process_event]: {} {operation_id} rejected: {err}", event.payload);
            store.mark_processed(operation_id).await?;
        }
        Err(err) => {
            debug!("[process_event]: {} {operation_id} deferred: {err}", event.payload);
        }
    }
    result
}

async fn apply<S: Store + ?Sized>(
    store: &S,
    local: &PublicKey,
    event: &ApplicationEvent,
) -> Result<ProcessResult, ProcessError> {
    match &event.payload {
        EventPayload::CalendarCreated(fields) => {
            create_calendar(store, local, event, EntityFields::Calendar(fields.clone())).await
        }
        EventPayload::CalendarUpdated(update) => {
            let EntityUpdate { id, fields } = update;
            update_entity(store, event, id, EntityFields::Calendar(fields.clone())).await
        }
        EventPayload::CalendarDeleted(entity) => {
            delete_entity(store, event, EntityKind::Calendar, &entity.id).await
        }

        EventPayload::SpaceCreated(CalendarScoped {
            calendar_id,
            fields,
        }) => create_entity(store, event, calendar_id, EntityFields::Space(fields.clone())).await,
        EventPayload::SpaceUpdated(update) => {
            update_entity(store, event, &update.id, EntityFields::Space(update.fields.clone()))
                .await
        }
        EventPayload::SpaceDeleted(entity) => {
            delete_entity(store, event, EntityKind::Space, &entity.id).await
        }

        EventPayload::ResourceCreated(CalendarScoped {
            calendar_id,
            fields,
        }) => {
            create_entity(
                store,
                event,
                calendar_id,
                EntityFields::Resource(fields.clone()),
            )
            .await
        }
        EventPayload::ResourceUpdated(update) => {
            update_entity(
                store,
                event,
                &update.id,
                EntityFields::Resource(update.fields.clone()),
            )
            .await
        }
        EventPayload::ResourceDeleted(entity) => {
            delete_entity(store, event, EntityKind::Resource, &entity.id).await
        }

        EventPayload::EventCreated(CalendarScoped {
            calendar_id,
            fields,
        }) => {
            let result =
                create_entity(store, event, calendar_id, EntityFields::Event(fields.clone()))
                    .await?;
            Ok(match result {
                ProcessResult::Applied(_) => ProcessResult::Applied(vec![SyncEffect::AddLogToTopic {
                    public_key: *event.author(),
                    topic: Topic::CalendarData(*calendar_id),
                    log_id: event.meta.log_path.clone(),
                }]),
                other => other,
            })
        }
        EventPayload::EventUpdated(update) => {
            update_entity(store, event, &update.id, EntityFields::Event(update.fields.clone()))
                .await
        }
        EventPayload::EventDeleted(entity) => {
            delete_entity(store, event, EntityKind::Event, &entity.id).await
        }

        EventPayload::BookingRequested(request) => request_booking(store, event, request).await,
        EventPayload::BookingAccepted(response) => {
            respond_booking(store, event, &response.request_id, true).await
        }
        EventPayload::BookingRejected(response) => {
            respond_booking(store, event, &response.request_id, false).await
        }

        EventPayload::CalendarAccessRequested(request) => {
            request_access(store, local, event, request).await
        }
        EventPayload::CalendarAccessAccepted(response) => {
            respond_access(store, local, event, &response.request_id, true).await
        }
        EventPayload::CalendarAccessRejected(response) => {
            respond_access(store, local, event, &response.request_id, false).await
        }

        EventPayload::UserRoleAssigned(assignment) => {
            assign_role(store, local, event, assignment).await
        }
    }
}

fn version_of(event: &ApplicationEvent) -> Version {
    Version::new(event.meta.timestamp, event.meta.operation_id)
}

/// Existing, non-deleted calendar, or the reason to stop.
async fn require_calendar<S: Store + ?Sized>(
    store: &S,
    calendar_id: &CalendarId,
) -> Result<Option<Entity>, ProcessError> {
    require_entity(store, EntityKind::Calendar, calendar_id).await
}

/// `Ok(Some)` when present, `Ok(None)` when deleted, `Err` when not seen yet.
async fn require_entity<S: Store + ?Sized>(
    store: &S,
    kind: EntityKind,
    id: &EntityId,
) -> Result<Option<Entity>, ProcessError> {
    if let Some(entity) = store.entity(kind, id).await? {
        return Ok(Some(entity));
    }
    if store.is_deleted(kind, id).await? {
        return Ok(None);
    }
    Err(ProcessError::MissingDependency(match kind {
        EntityKind::Calendar => Dependency::Calendar(*id),
        _ => Dependency::Entity { kind, id: *id },
    }))
}

/// Reject `event` unless its author manages the calendar. A rejected event is
/// held until the author is promoted.
async fn require_manager<S: Store + ?Sized>(
    store: &S,
    calendar_id: &CalendarId,
    event: &ApplicationEvent,
    action: &str,
) -> Result<(), ProcessError> {
    let author = event.author();
    if can_manage(store, calendar_id, author).await? {
        return Ok(());
    }
    store.hold_mutation(calendar_id, event.clone()).await?;
    Err(ProcessError::Rejected(format!(
        "{author} may not {action} in calendar {calendar_id}: owner or admin required"
    )))
}

// ─────────────────────────── Entities ───────────────────────────

async fn create_calendar<S: Store + ?Sized>(
    store: &S,
    local: &PublicKey,
    event: &ApplicationEvent,
    fields: EntityFields,
) -> Result<ProcessResult, ProcessError> {
    let calendar_id = *event.operation_id();
    if store.is_deleted(EntityKind::Calendar, &calendar_id).await? {
        return Ok(ProcessResult::Stale);
    }
    let author = *event.author();
    let version = version_of(event);

    // Re-applying a creation must not roll back later updates.
    if store.entity(EntityKind::Calendar, &calendar_id).await?.is_none() {
        store
            .put_entity(Entity {
                id: calendar_id,
                calendar_id,
                author,
                created: version,
                updated: version,
                fields,
            })
            .await?;
    }
    if store.user(&calendar_id, &author).await?.is_none() {
        store
            .put_user(User {
                calendar_id,
                public_key: author,
                name: None,
                role: Role::Owner,
                role_version: None,
            })
            .await?;
    }

    let data_topic = Topic::CalendarData(calendar_id);
    let mut effects = vec![
        SyncEffect::AddLogToTopic {
            public_key: author,
            topic: data_topic.clone(),
            log_id: event.meta.log_path.clone(),
        },
        SyncEffect::AddLogToTopic {
            public_key: author,
            topic: data_topic.clone(),
            log_id: calendar_data_log(&calendar_id),
        },
    ];
    if author == *local {
        effects.push(SyncEffect::Subscribe(data_topic));
        effects.push(SyncEffect::Subscribe(Topic::CalendarInbox(calendar_id)));
    }
    Ok(ProcessResult::Applied(effects))
}

async fn create_entity<S: Store + ?Sized>(
    store: &S,
    event: &ApplicationEvent,
    calendar_id: &CalendarId,
    fields: EntityFields,
) -> Result<ProcessResult, ProcessError> {
    if require_calendar(store, calendar_id).await?.is_none() {
        return Ok(ProcessResult::Stale);
    }
    let id = *event.operation_id();
    if store.is_deleted(fields.kind(), &id).await? {
        return Ok(ProcessResult::Stale);
    }
    if store.entity(fields.kind(), &id).await?.is_some() {
        debug!("[create_entity]: {} {id} already stored", fields.kind());
        return Ok(ProcessResult::Applied(Vec::new()));
    }

    let version = version_of(event);
    store
        .put_entity(Entity {
            id,
            calendar_id: *calendar_id,
            author: *event.author(),
            created: version,
            updated: version,
            fields,
        })
        .await?;
    Ok(ProcessResult::Applied(Vec::new()))
}

async fn update_entity<S: Store + ?Sized>(
    store: &S,
    event: &ApplicationEvent,
    id: &EntityId,
    fields: EntityFields,
) -> Result<ProcessResult, ProcessError> {
    let kind = fields.kind();
    let Some(current) = require_entity(store, kind, id).await? else {
        return Ok(ProcessResult::Stale);
    };
    require_manager(store, &current.calendar_id, event, &format!("update {kind}")).await?;

    let version = version_of(event);
    if current.updated.operation_id == version.operation_id {
        return Ok(ProcessResult::Duplicate);
    }
    if !current.updated.is_superseded_by(&version)? {
        return Ok(ProcessResult::Stale);
    }

    store
        .put_entity(Entity {
            updated: version,
            fields,
            ..current
        })
        .await?;
    Ok(ProcessResult::Applied(Vec::new()))
}

async fn delete_entity<S: Store + ?Sized>(
    store: &S,
    event: &ApplicationEvent,
    kind: EntityKind,
    id: &EntityId,
) -> Result<ProcessResult, ProcessError> {
    let Some(current) = require_entity(store, kind, id).await? else {
        return Ok(ProcessResult::Stale);
    };
    require_manager(store, &current.calendar_id, event, &format!("delete {kind}")).await?;

    if kind == EntityKind::Calendar {
        // Children go first so a crash in between leaves a retryable state.
        for child_kind in [EntityKind::Space, EntityKind::Resource, EntityKind::Event] {
            for child in store.entities(child_kind, id).await? {
                store.delete_entity(child_kind, &child.id).await?;
            }
        }
    }
    store.delete_entity(kind, id).await?;
    Ok(ProcessResult::Applied(Vec::new()))
}

// ─────────────────────────── Bookings ───────────────────────────

async fn request_booking<S: Store + ?Sized>(
    store: &S,
    event: &ApplicationEvent,
    request: &BookingRequested,
) -> Result<ProcessResult, ProcessError> {
    if require_calendar(store, &request.calendar_id).await?.is_none()
        || require_entity(store, EntityKind::Event, &request.event_id)
            .await?
            .is_none()
    {
        return Ok(ProcessResult::Stale);
    }

    let bookable = match store.entity(EntityKind::Space, &request.resource_id).await? {
        Some(space) => Some(space),
        None => store
            .entity(EntityKind::Resource, &request.resource_id)
            .await?,
    };
    if bookable.is_none() {
        let deleted = store
            .is_deleted(EntityKind::Space, &request.resource_id)
            .await?
            || store
                .is_deleted(EntityKind::Resource, &request.resource_id)
                .await?;
        if deleted {
            return Ok(ProcessResult::Stale);
        }
        return Err(ProcessError::MissingDependency(Dependency::Entity {
            kind: EntityKind::Resource,
            id: request.resource_id,
        }));
    }

    store
        .put_booking_request(BookingRequest {
            id: *event.operation_id(),
            calendar_id: request.calendar_id,
            event_id: request.event_id,
            resource_id: request.resource_id,
            requester: *event.author(),
            message: request.message.clone(),
        })
        .await?;
    Ok(ProcessResult::Applied(Vec::new()))
}

/// Booking responses are logged unconditionally; whether they count is
/// decided when the status is derived.
async fn respond_booking<S: Store + ?Sized>(
    store: &S,
    event: &ApplicationEvent,
    request_id: &OperationId,
    accept: bool,
) -> Result<ProcessResult, ProcessError> {
    store
        .put_booking_response(BookingResponse {
            id: *event.operation_id(),
            request_id: *request_id,
            responder: *event.author(),
            accept,
            version: version_of(event),
        })
        .await?;
    Ok(ProcessResult::Applied(Vec::new()))
}

// ─────────────────────────── Access ───────────────────────────

async fn request_access<S: Store + ?Sized>(
    store: &S,
    local: &PublicKey,
    event: &ApplicationEvent,
    requested: &AccessRequested,
) -> Result<ProcessResult, ProcessError> {
    let request = AccessRequest {
        id: *event.operation_id(),
        calendar_id: requested.calendar_id,
        public_key: *event.author(),
        name: requested.name.clone(),
    };
    store.put_access_request(request.clone()).await?;

    // The accepting response may have arrived first.
    let mut effects = Vec::new();
    for response in store.access_responses(&request.id).await? {
        if response.accept && grant_is_effective(store, &request, &response).await? {
            effects = grant_access(store, local, &request).await?;
            break;
        }
    }
    Ok(ProcessResult::Applied(effects))
}

async fn respond_access<S: Store + ?Sized>(
    store: &S,
    local: &PublicKey,
    event: &ApplicationEvent,
    request_id: &OperationId,
    accept: bool,
) -> Result<ProcessResult, ProcessError> {
    let response = AccessResponse {
        id: *event.operation_id(),
        request_id: *request_id,
        from_public_key: *event.author(),
        accept,
    };
    store.put_access_response(response.clone()).await?;

    let Some(request) = store.access_request(request_id).await? else {
        // Recorded; the request handler picks it up on arrival.
        return Ok(ProcessResult::Applied(Vec::new()));
    };

    if !grant_is_effective(store, &request, &response).await? {
        return Err(ProcessError::Rejected(format!(
            "{} does not manage calendar {}; response logged but does not count",
            response.from_public_key, request.calendar_id
        )));
    }
    if !accept {
        return Ok(ProcessResult::Applied(Vec::new()));
    }
    let effects = grant_access(store, local, &request).await?;
    Ok(ProcessResult::Applied(effects))
}

/// Whether a response should drive sync effects.
///
/// When the calendar is known the responder must manage it. A peer that has
/// not synced the calendar yet cannot check, and needs the subscription to
/// ever receive it; `has_access` stays strict either way.
async fn grant_is_effective<S: Store + ?Sized>(
    store: &S,
    request: &AccessRequest,
    response: &AccessResponse,
) -> Result<bool, StoreError> {
    let calendar_known = store
        .entity(EntityKind::Calendar, &request.calendar_id)
        .await?
        .is_some();
    if !calendar_known {
        return Ok(true);
    }
    can_manage(store, &request.calendar_id, &response.from_public_key).await
}

async fn grant_access<S: Store + ?Sized>(
    store: &S,
    local: &PublicKey,
    request: &AccessRequest,
) -> Result<Vec<SyncEffect>, ProcessError> {
    let calendar_id = request.calendar_id;
    if store.user(&calendar_id, &request.public_key).await?.is_none() {
        store
            .put_user(User {
                calendar_id,
                public_key: request.public_key,
                name: request.name.clone(),
                role: Role::Member,
                role_version: None,
            })
            .await?;
    }

    let data_topic = Topic::CalendarData(calendar_id);
    let mut effects = vec![SyncEffect::AddLogToTopic {
        public_key: request.public_key,
        topic: data_topic.clone(),
        log_id: calendar_data_log(&calendar_id),
    }];
    if request.public_key == *local {
        info!("[grant_access]: access to calendar {calendar_id} granted to this peer");
        effects.push(SyncEffect::Subscribe(data_topic));
    }
    Ok(effects)
}

// ─────────────────────────── Roles ───────────────────────────

async fn assign_role<S: Store + ?Sized>(
    store: &S,
    local: &PublicKey,
    event: &ApplicationEvent,
    assignment: &RoleAssigned,
) -> Result<ProcessResult, ProcessError> {
    let RoleAssigned {
        calendar_id,
        public_key,
        role,
    } = assignment;
    let Some(calendar) = require_calendar(store, calendar_id).await? else {
        return Ok(ProcessResult::Stale);
    };
    if *role == Role::Owner {
        return Err(ProcessError::Rejected(
            "the owner role cannot be assigned".to_string(),
        ));
    }
    if calendar.author == *public_key {
        return Err(ProcessError::Rejected(
            "the owner's role cannot be changed".to_string(),
        ));
    }
    require_manager(store, calendar_id, event, "assign roles").await?;

    let version = version_of(event);
    let current = store.user(calendar_id, public_key).await?;
    let current_version = current.as_ref().and_then(|user| user.role_version);
    let outcome = match current_version {
        Some(role_version) if role_version.operation_id == version.operation_id => {
            ProcessResult::Duplicate
        }
        Some(role_version) if !role_version.is_superseded_by(&version)? => {
            return Ok(ProcessResult::Stale);
        }
        _ => {
            store
                .put_user(User {
                    calendar_id: *calendar_id,
                    public_key: *public_key,
                    name: current.and_then(|user| user.name),
                    role: *role,
                    role_version: Some(version),
                })
                .await?;
            ProcessResult::Applied(Vec::new())
        }
    };

    if role.can_manage() {
        release_held(store, local, *calendar_id, *public_key).await?;
    }
    Ok(outcome)
}

/// Apply the held mutations of a newly promoted `author` again, oldest first.
///
/// Boxed because a released role assignment can promote someone else in turn.
fn release_held<'a, S: Store + ?Sized>(
    store: &'a S,
    local: &'a PublicKey,
    calendar_id: CalendarId,
    author: PublicKey,
) -> Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send + 'a>> {
    Box::pin(async move {
        for held in store.held_mutations(&calendar_id, &author).await? {
            let operation_id = held.meta.operation_id;
            match apply(store, local, &held).await {
                Ok(outcome) => {
                    info!(
                        "[release_held]: {} {operation_id} from {author} → {outcome:?}",
                        held.payload
                    );
                    store.release_mutation(&operation_id).await?;
                }
                Err(ProcessError::Store(e)) => return Err(ProcessError::Store(e)),
                Err(err @ (ProcessError::Rejected(_) | ProcessError::MissingDependency(_))) => {
                    debug!("[release_held]: {operation_id} stays held: {err}");
                }
                Err(err) => {
                    warn!("[release_held]: {} {operation_id} dropped: {err}", held.payload);
                    store.release_mutation(&operation_id).await?;
                }
            }
        }
        Ok(())
    })
}
