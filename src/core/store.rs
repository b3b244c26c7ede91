//! Local persistent store interface and an in-memory implementation.
//!
//! Every write is an atomic, idempotent upsert keyed by id. Event handlers
//! may interleave at any `.await`, so no method relies on a caller holding a
//! lock across calls.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::error::StoreError;
use crate::core::events::ApplicationEvent;
use crate::core::types::{
    AccessRequest, AccessResponse, BookingRequest, BookingResponse, CalendarId, Entity, EntityId,
    EntityKind, OperationId, PublicKey, User,
};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ── Entities ──
    async fn entity(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>, StoreError>;
    async fn entities(
        &self,
        kind: EntityKind,
        calendar_id: &CalendarId,
    ) -> Result<Vec<Entity>, StoreError>;
    async fn put_entity(&self, entity: Entity) -> Result<(), StoreError>;
    /// Remove an entity and leave a tombstone behind.
    async fn delete_entity(&self, kind: EntityKind, id: &EntityId) -> Result<(), StoreError>;
    async fn is_deleted(&self, kind: EntityKind, id: &EntityId) -> Result<bool, StoreError>;
    /// Find a calendar whose hex id starts with `prefix`.
    async fn calendar_by_prefix(&self, prefix: &str) -> Result<Option<Entity>, StoreError>;

    // ── Users ──
    async fn user(
        &self,
        calendar_id: &CalendarId,
        public_key: &PublicKey,
    ) -> Result<Option<User>, StoreError>;
    async fn users(&self, calendar_id: &CalendarId) -> Result<Vec<User>, StoreError>;
    async fn put_user(&self, user: User) -> Result<(), StoreError>;

    // ── Access log ──
    async fn put_access_request(&self, request: AccessRequest) -> Result<(), StoreError>;
    async fn access_request(&self, id: &OperationId) -> Result<Option<AccessRequest>, StoreError>;
    async fn access_requests(
        &self,
        calendar_id: &CalendarId,
        public_key: &PublicKey,
    ) -> Result<Vec<AccessRequest>, StoreError>;
    async fn put_access_response(&self, response: AccessResponse) -> Result<(), StoreError>;
    async fn access_responses(
        &self,
        request_id: &OperationId,
    ) -> Result<Vec<AccessResponse>, StoreError>;

    // ── Booking log ──
    async fn put_booking_request(&self, request: BookingRequest) -> Result<(), StoreError>;
    async fn booking_request(&self, id: &OperationId)
        -> Result<Option<BookingRequest>, StoreError>;
    async fn put_booking_response(&self, response: BookingResponse) -> Result<(), StoreError>;
    async fn booking_responses(
        &self,
        request_id: &OperationId,
    ) -> Result<Vec<BookingResponse>, StoreError>;

    // ── Processed operations ──
    async fn is_processed(&self, id: &OperationId) -> Result<bool, StoreError>;
    async fn mark_processed(&self, id: &OperationId) -> Result<(), StoreError>;

    // ── Held mutations ──
    /// Keep a mutation that was rejected because its author did not manage
    /// `calendar_id` yet. Keyed by operation id.
    async fn hold_mutation(
        &self,
        calendar_id: &CalendarId,
        event: ApplicationEvent,
    ) -> Result<(), StoreError>;
    /// Held mutations of `author` in the calendar, oldest first by
    /// `(timestamp, operation id)`.
    async fn held_mutations(
        &self,
        calendar_id: &CalendarId,
        author: &PublicKey,
    ) -> Result<Vec<ApplicationEvent>, StoreError>;
    async fn release_mutation(&self, id: &OperationId) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    entities: HashMap<(EntityKind, EntityId), Entity>,
    tombstones: HashSet<(EntityKind, EntityId)>,
    users: HashMap<(CalendarId, PublicKey), User>,
    access_requests: HashMap<OperationId, AccessRequest>,
    access_responses: HashMap<OperationId, AccessResponse>,
    booking_requests: HashMap<OperationId, BookingRequest>,
    booking_responses: HashMap<OperationId, BookingResponse>,
    processed: HashSet<OperationId>,
    held: HashMap<OperationId, (CalendarId, ApplicationEvent)>,
}

/// In-memory [`Store`], cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn entity(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>, StoreError> {
        Ok(self.inner.read().await.entities.get(&(kind, *id)).cloned())
    }

    async fn entities(
        &self,
        kind: EntityKind,
        calendar_id: &CalendarId,
    ) -> Result<Vec<Entity>, StoreError> {
        let tables = self.inner.read().await;
        let mut found: Vec<Entity> = tables
            .entities
            .values()
            .filter(|e| e.kind() == kind && e.calendar_id == *calendar_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    async fn put_entity(&self, entity: Entity) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        let key = (entity.kind(), entity.id);
        if tables.tombstones.contains(&key) {
            return Ok(());
        }
        tables.entities.insert(key, entity);
        Ok(())
    }

    async fn delete_entity(&self, kind: EntityKind, id: &EntityId) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        tables.entities.remove(&(kind, *id));
        tables.tombstones.insert((kind, *id));
        Ok(())
    }

    async fn is_deleted(&self, kind: EntityKind, id: &EntityId) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.tombstones.contains(&(kind, *id)))
    }

    async fn calendar_by_prefix(&self, prefix: &str) -> Result<Option<Entity>, StoreError> {
        let tables = self.inner.read().await;
        let mut matches: Vec<&Entity> = tables
            .entities
            .values()
            .filter(|e| e.kind() == EntityKind::Calendar && e.id.to_hex().starts_with(prefix))
            .collect();
        matches.sort_by_key(|e| e.id);
        Ok(matches.first().map(|e| (*e).clone()))
    }

    async fn user(
        &self,
        calendar_id: &CalendarId,
        public_key: &PublicKey,
    ) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .get(&(*calendar_id, *public_key))
            .cloned())
    }

    async fn users(&self, calendar_id: &CalendarId) -> Result<Vec<User>, StoreError> {
        let tables = self.inner.read().await;
        let mut users: Vec<User> = tables
            .users
            .values()
            .filter(|u| u.calendar_id == *calendar_id)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.public_key);
        Ok(users)
    }

    async fn put_user(&self, user: User) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .users
            .insert((user.calendar_id, user.public_key), user);
        Ok(())
    }

    async fn put_access_request(&self, request: AccessRequest) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .access_requests
            .insert(request.id, request);
        Ok(())
    }

    async fn access_request(&self, id: &OperationId) -> Result<Option<AccessRequest>, StoreError> {
        Ok(self.inner.read().await.access_requests.get(id).cloned())
    }

    async fn access_requests(
        &self,
        calendar_id: &CalendarId,
        public_key: &PublicKey,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        let tables = self.inner.read().await;
        let mut requests: Vec<AccessRequest> = tables
            .access_requests
            .values()
            .filter(|r| r.calendar_id == *calendar_id && r.public_key == *public_key)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.id);
        Ok(requests)
    }

    async fn put_access_response(&self, response: AccessResponse) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .access_responses
            .insert(response.id, response);
        Ok(())
    }

    async fn access_responses(
        &self,
        request_id: &OperationId,
    ) -> Result<Vec<AccessResponse>, StoreError> {
        let tables = self.inner.read().await;
        let mut responses: Vec<AccessResponse> = tables
            .access_responses
            .values()
            .filter(|r| r.request_id == *request_id)
            .cloned()
            .collect();
        responses.sort_by_key(|r| r.id);
        Ok(responses)
    }

    async fn put_booking_request(&self, request: BookingRequest) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .booking_requests
            .insert(request.id, request);
        Ok(())
    }

    async fn booking_request(
        &self,
        id: &OperationId,
    ) -> Result<Option<BookingRequest>, StoreError> {
        Ok(self.inner.read().await.booking_requests.get(id).cloned())
    }

    async fn put_booking_response(&self, response: BookingResponse) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .booking_responses
            .insert(response.id, response);
        Ok(())
    }

    async fn booking_responses(
        &self,
        request_id: &OperationId,
    ) -> Result<Vec<BookingResponse>, StoreError> {
        let tables = self.inner.read().await;
        let mut responses: Vec<BookingResponse> = tables
            .booking_responses
            .values()
            .filter(|r| r.request_id == *request_id)
            .cloned()
            .collect();
        responses.sort_by_key(|r| r.id);
        Ok(responses)
    }

    async fn is_processed(&self, id: &OperationId) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.processed.contains(id))
    }

    async fn mark_processed(&self, id: &OperationId) -> Result<(), StoreError> {
        self.inner.write().await.processed.insert(*id);
        Ok(())
    }

    async fn hold_mutation(
        &self,
        calendar_id: &CalendarId,
        event: ApplicationEvent,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .held
            .insert(event.meta.operation_id, (*calendar_id, event));
        Ok(())
    }

    async fn held_mutations(
        &self,
        calendar_id: &CalendarId,
        author: &PublicKey,
    ) -> Result<Vec<ApplicationEvent>, StoreError> {
        let tables = self.inner.read().await;
        let mut held: Vec<ApplicationEvent> = tables
            .held
            .values()
            .filter(|(calendar, event)| calendar == calendar_id && event.meta.author == *author)
            .map(|(_, event)| event.clone())
            .collect();
        held.sort_by_key(|event| (event.meta.timestamp, event.meta.operation_id));
        Ok(held)
    }

    async fn release_mutation(&self, id: &OperationId) -> Result<(), StoreError> {
        self.inner.write().await.held.remove(id);
        Ok(())
    }
}
