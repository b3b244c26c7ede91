//! Integration tests for `process_event` against the in-memory store.

use chrono::{TimeZone, Utc};

use de_cal::core::{
    apply_event, booking_status, process_event, ApplicationEvent, BookingRequested, BookingStatus,
    CalendarFields, CalendarScoped, Dependency, EntityFields, EntityKind, EntityRef, EntityUpdate,
    EventFields, EventMeta, EventPayload, Hash, MemoryStore, ProcessError, ProcessResult,
    PublicKey, ResourceFields, ResponseRef, Role, RoleAssigned, SpaceFields, Store, SyncEffect,
};
use de_cal::ds::Topic;

// ─────────────────────────── Helpers ───────────────────────────

fn key(byte: u8) -> PublicKey {
    PublicKey::from_bytes([byte; 32])
}

fn op(byte: u8) -> Hash {
    Hash::from_bytes([byte; 32])
}

fn event(id: u8, author: PublicKey, timestamp: u64, payload: EventPayload) -> ApplicationEvent {
    ApplicationEvent {
        payload,
        meta: EventMeta {
            operation_id: op(id),
            author,
            stream_id: op(0),
            log_path: format!("test/{id}"),
            timestamp,
        },
    }
}

fn calendar_fields(name: &str) -> CalendarFields {
    CalendarFields {
        name: name.to_string(),
        start_date: None,
        end_date: None,
    }
}

fn event_fields(name: &str) -> EventFields {
    EventFields {
        name: name.to_string(),
        description: None,
        start: Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        space_id: None,
        resource_ids: Vec::new(),
    }
}

const OWNER: u8 = 1;
const CALENDAR: u8 = 10;

fn create_calendar() -> ApplicationEvent {
    event(
        CALENDAR,
        key(OWNER),
        100,
        EventPayload::CalendarCreated(calendar_fields("Festival")),
    )
}

fn create_event(id: u8, author: PublicKey, ts: u64) -> ApplicationEvent {
    event(
        id,
        author,
        ts,
        EventPayload::EventCreated(CalendarScoped {
            calendar_id: op(CALENDAR),
            fields: event_fields("Opening"),
        }),
    )
}

fn update_event(id: u8, target: u8, author: PublicKey, ts: u64, name: &str) -> ApplicationEvent {
    event(
        id,
        author,
        ts,
        EventPayload::EventUpdated(EntityUpdate {
            id: op(target),
            fields: event_fields(name),
        }),
    )
}

async fn event_name(store: &MemoryStore, id: u8) -> Option<String> {
    store
        .entity(EntityKind::Event, &op(id))
        .await
        .unwrap()
        .map(|entity| entity.name().to_string())
}

// ─────────────────────────── Calendars ───────────────────────────

#[tokio::test]
async fn test_calendar_created_registers_logs_and_owner() {
    let store = MemoryStore::new();
    let created = create_calendar();

    let result = process_event(&store, &key(OWNER), &created).await.unwrap();
    let data = Topic::CalendarData(op(CALENDAR));
    assert_eq!(
        result.effects(),
        &[
            SyncEffect::AddLogToTopic {
                public_key: key(OWNER),
                topic: data.clone(),
                log_id: created.meta.log_path.clone(),
            },
            SyncEffect::AddLogToTopic {
                public_key: key(OWNER),
                topic: data.clone(),
                log_id: format!("calendar/{}/data", op(CALENDAR)),
            },
            SyncEffect::Subscribe(data),
            SyncEffect::Subscribe(Topic::CalendarInbox(op(CALENDAR))),
        ]
    );

    let owner = store.user(&op(CALENDAR), &key(OWNER)).await.unwrap().unwrap();
    assert_eq!(owner.role, Role::Owner);
}

#[tokio::test]
async fn test_remote_calendar_creation_does_not_subscribe() {
    let store = MemoryStore::new();
    let result = process_event(&store, &key(9), &create_calendar())
        .await
        .unwrap();
    assert!(!result
        .effects()
        .iter()
        .any(|effect| matches!(effect, SyncEffect::Subscribe(_))));
}

// ─────────────────────────── Idempotence ───────────────────────────

#[tokio::test]
async fn test_redelivery_is_duplicate_and_changes_nothing() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    let created = create_event(20, key(OWNER), 200);
    process_event(&store, &key(OWNER), &created).await.unwrap();
    let before = store.entity(EntityKind::Event, &op(20)).await.unwrap();

    for _ in 0..3 {
        assert_eq!(
            process_event(&store, &key(OWNER), &created).await.unwrap(),
            ProcessResult::Duplicate
        );
    }
    assert_eq!(store.entity(EntityKind::Event, &op(20)).await.unwrap(), before);
}

// ─────────────────────────── Ordering ───────────────────────────

#[tokio::test]
async fn test_update_before_create_is_deferred() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();

    let update = update_event(21, 20, key(OWNER), 300, "Opening (moved)");
    let err = process_event(&store, &key(OWNER), &update).await.unwrap_err();
    assert!(matches!(
        err,
        ProcessError::MissingDependency(Dependency::Entity {
            kind: EntityKind::Event,
            ..
        })
    ));
    // Deferred events are not recorded, so the redelivery is processed.
    assert!(!store.is_processed(&op(21)).await.unwrap());

    process_event(&store, &key(OWNER), &create_event(20, key(OWNER), 200))
        .await
        .unwrap();
    assert_eq!(
        process_event(&store, &key(OWNER), &update).await.unwrap(),
        ProcessResult::Applied(Vec::new())
    );
    assert_eq!(event_name(&store, 20).await.as_deref(), Some("Opening (moved)"));
}

#[tokio::test]
async fn test_concurrent_updates_converge_in_any_order() {
    let events = [
        create_calendar(),
        create_event(20, key(OWNER), 200),
        update_event(21, 20, key(OWNER), 300, "first"),
        update_event(22, 20, key(OWNER), 400, "second"),
        // Same timestamp as the previous one; the larger id wins.
        update_event(23, 20, key(OWNER), 400, "third"),
    ];

    let in_order = MemoryStore::new();
    for e in &events {
        process_event(&in_order, &key(OWNER), e).await.unwrap();
    }

    let reversed = MemoryStore::new();
    for e in [&events[0], &events[1], &events[4], &events[3], &events[2]] {
        process_event(&reversed, &key(OWNER), e).await.unwrap();
    }

    assert_eq!(event_name(&in_order, 20).await.as_deref(), Some("third"));
    assert_eq!(
        in_order.entity(EntityKind::Event, &op(20)).await.unwrap(),
        reversed.entity(EntityKind::Event, &op(20)).await.unwrap()
    );
}

#[tokio::test]
async fn test_older_update_is_stale() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    process_event(&store, &key(OWNER), &create_event(20, key(OWNER), 200))
        .await
        .unwrap();
    process_event(&store, &key(OWNER), &update_event(22, 20, key(OWNER), 400, "new"))
        .await
        .unwrap();

    assert_eq!(
        process_event(&store, &key(OWNER), &update_event(21, 20, key(OWNER), 300, "old"))
            .await
            .unwrap(),
        ProcessResult::Stale
    );
    assert_eq!(event_name(&store, 20).await.as_deref(), Some("new"));
}

// ─────────────────────────── Authorization ───────────────────────────

#[tokio::test]
async fn test_member_update_is_rejected_and_recorded() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    process_event(&store, &key(OWNER), &create_event(20, key(OWNER), 200))
        .await
        .unwrap();

    let update = update_event(21, 20, key(5), 300, "hijacked");
    let err = process_event(&store, &key(OWNER), &update).await.unwrap_err();
    assert!(matches!(err, ProcessError::Rejected(_)));
    assert!(err.is_permanent());
    assert!(store.is_processed(&op(21)).await.unwrap());
    assert_eq!(event_name(&store, 20).await.as_deref(), Some("Opening"));

    // The decision does not flip on redelivery.
    assert_eq!(
        process_event(&store, &key(OWNER), &update).await.unwrap(),
        ProcessResult::Duplicate
    );
}

#[tokio::test]
async fn test_admin_may_update_after_role_assignment() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    process_event(&store, &key(OWNER), &create_event(20, key(OWNER), 200))
        .await
        .unwrap();
    let assign = event(
        30,
        key(OWNER),
        250,
        EventPayload::UserRoleAssigned(RoleAssigned {
            calendar_id: op(CALENDAR),
            public_key: key(5),
            role: Role::Admin,
        }),
    );
    process_event(&store, &key(OWNER), &assign).await.unwrap();

    process_event(&store, &key(OWNER), &update_event(21, 20, key(5), 300, "by admin"))
        .await
        .unwrap();
    assert_eq!(event_name(&store, 20).await.as_deref(), Some("by admin"));
}

#[tokio::test]
async fn test_role_assignment_rules() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    let assign = |id: u8, author: u8, target: u8, role: Role, ts: u64| {
        event(
            id,
            key(author),
            ts,
            EventPayload::UserRoleAssigned(RoleAssigned {
                calendar_id: op(CALENDAR),
                public_key: key(target),
                role,
            }),
        )
    };

    // Nobody becomes owner, the owner stays owner, members cannot assign.
    for bad in [
        assign(30, OWNER, 5, Role::Owner, 200),
        assign(31, OWNER, OWNER, Role::Member, 200),
        assign(32, 6, 5, Role::Admin, 200),
    ] {
        assert!(matches!(
            process_event(&store, &key(OWNER), &bad).await,
            Err(ProcessError::Rejected(_))
        ));
    }

    // Later assignment wins regardless of arrival order.
    process_event(&store, &key(OWNER), &assign(34, OWNER, 5, Role::Member, 400))
        .await
        .unwrap();
    assert_eq!(
        process_event(&store, &key(OWNER), &assign(33, OWNER, 5, Role::Admin, 300))
            .await
            .unwrap(),
        ProcessResult::Stale
    );
    let user = store.user(&op(CALENDAR), &key(5)).await.unwrap().unwrap();
    assert_eq!(user.role, Role::Member);
}

fn assign_role(id: u8, author: u8, target: u8, role: Role, ts: u64) -> ApplicationEvent {
    event(
        id,
        key(author),
        ts,
        EventPayload::UserRoleAssigned(RoleAssigned {
            calendar_id: op(CALENDAR),
            public_key: key(target),
            role,
        }),
    )
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut all = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let first = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first.clone());
            all.push(tail);
        }
    }
    all
}

/// Deliver in order, redelivering deferred events until all are processed.
async fn deliver(store: &MemoryStore, events: &[ApplicationEvent]) {
    let mut pending: Vec<&ApplicationEvent> = events.iter().collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();
        for e in pending {
            match process_event(store, &key(OWNER), e).await {
                Ok(_) => {}
                Err(ProcessError::MissingDependency(_)) => deferred.push(e),
                Err(err) if err.is_permanent() => {}
                Err(err) => panic!("unexpected failure for {}: {err}", e.payload),
            }
        }
        assert!(deferred.len() < before, "redelivery made no progress");
        pending = deferred;
    }
}

#[tokio::test]
async fn test_promotion_converges_in_any_order() {
    const B: u8 = 5;
    const C: u8 = 6;
    // B is promoted by the owner, then promotes C. Both edit the event.
    let events = vec![
        create_calendar(),
        create_event(20, key(OWNER), 200),
        assign_role(30, OWNER, B, Role::Admin, 250),
        assign_role(31, B, C, Role::Admin, 260),
        update_event(21, 20, key(B), 300, "by b"),
        update_event(22, 20, key(C), 350, "by c"),
    ];

    for order in permutations(&events) {
        let store = MemoryStore::new();
        deliver(&store, &order).await;

        assert_eq!(event_name(&store, 20).await.as_deref(), Some("by c"));
        for peer in [B, C] {
            let user = store.user(&op(CALENDAR), &key(peer)).await.unwrap().unwrap();
            assert_eq!(user.role, Role::Admin);
        }

        // Redelivery of everything changes nothing.
        for e in &order {
            assert_eq!(
                process_event(&store, &key(OWNER), e).await.unwrap(),
                ProcessResult::Duplicate
            );
        }
        assert_eq!(event_name(&store, 20).await.as_deref(), Some("by c"));
    }
}

#[tokio::test]
async fn test_update_held_until_author_is_promoted() {
    let store = MemoryStore::new();
    deliver(
        &store,
        &[create_calendar(), create_event(20, key(OWNER), 200)],
    )
    .await;

    let update = update_event(21, 20, key(5), 300, "by admin");
    assert!(matches!(
        process_event(&store, &key(OWNER), &update).await,
        Err(ProcessError::Rejected(_))
    ));
    assert_eq!(store.held_mutations(&op(CALENDAR), &key(5)).await.unwrap().len(), 1);

    // Promotion to member does not release anything.
    process_event(&store, &key(OWNER), &assign_role(30, OWNER, 5, Role::Member, 250))
        .await
        .unwrap();
    assert_eq!(event_name(&store, 20).await.as_deref(), Some("Opening"));

    process_event(&store, &key(OWNER), &assign_role(31, OWNER, 5, Role::Admin, 260))
        .await
        .unwrap();
    assert_eq!(event_name(&store, 20).await.as_deref(), Some("by admin"));
    assert!(store
        .held_mutations(&op(CALENDAR), &key(5))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_reapplied_creation_keeps_later_update() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();

    // Applied but not yet marked processed, as after a failed commit.
    let created = create_event(20, key(OWNER), 200);
    apply_event(&store, &key(OWNER), &created).await.unwrap();
    assert!(!store.is_processed(&op(20)).await.unwrap());

    process_event(&store, &key(OWNER), &update_event(21, 20, key(OWNER), 300, "renamed"))
        .await
        .unwrap();
    let again = apply_event(&store, &key(OWNER), &created).await.unwrap();
    assert!(matches!(again, ProcessResult::Applied(_)));
    assert_eq!(event_name(&store, 20).await.as_deref(), Some("renamed"));

    let calendar_again = apply_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    assert_eq!(calendar_again, ProcessResult::Duplicate);
}

// ─────────────────────────── Deletion ───────────────────────────

#[tokio::test]
async fn test_calendar_deletion_cascades_and_leaves_tombstones() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    process_event(&store, &key(OWNER), &create_event(20, key(OWNER), 200))
        .await
        .unwrap();
    let delete = event(
        40,
        key(OWNER),
        500,
        EventPayload::CalendarDeleted(EntityRef { id: op(CALENDAR) }),
    );
    process_event(&store, &key(OWNER), &delete).await.unwrap();

    assert!(store.is_deleted(EntityKind::Calendar, &op(CALENDAR)).await.unwrap());
    assert!(store.is_deleted(EntityKind::Event, &op(20)).await.unwrap());

    // Late arrivals for the deleted calendar are no-ops, not dependencies.
    assert_eq!(
        process_event(&store, &key(OWNER), &update_event(21, 20, key(OWNER), 300, "late"))
            .await
            .unwrap(),
        ProcessResult::Stale
    );
    let late_space = event(
        41,
        key(OWNER),
        300,
        EventPayload::SpaceCreated(CalendarScoped {
            calendar_id: op(CALENDAR),
            fields: SpaceFields {
                name: "Hall".to_string(),
                description: None,
                location: None,
                capacity: Some(40),
            },
        }),
    );
    assert_eq!(
        process_event(&store, &key(OWNER), &late_space).await.unwrap(),
        ProcessResult::Stale
    );
    assert!(store.entity(EntityKind::Space, &op(41)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_creation_inside_unknown_calendar_is_deferred() {
    let store = MemoryStore::new();
    let err = process_event(&store, &key(OWNER), &create_event(20, key(OWNER), 200))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::MissingDependency(Dependency::Calendar(_))
    ));
}

// ─────────────────────────── Bookings ───────────────────────────

#[tokio::test]
async fn test_booking_status_follows_authorized_responses() {
    let store = MemoryStore::new();
    let resource_owner = key(7);
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    process_event(&store, &key(OWNER), &create_event(20, key(3), 200))
        .await
        .unwrap();
    let resource = event(
        50,
        resource_owner,
        210,
        EventPayload::ResourceCreated(CalendarScoped {
            calendar_id: op(CALENDAR),
            fields: ResourceFields {
                name: "Projector".to_string(),
                description: None,
            },
        }),
    );
    process_event(&store, &key(OWNER), &resource).await.unwrap();

    let request = event(
        51,
        key(3),
        300,
        EventPayload::BookingRequested(BookingRequested {
            calendar_id: op(CALENDAR),
            event_id: op(20),
            resource_id: op(50),
            message: Some("for the talk".to_string()),
        }),
    );
    process_event(&store, &key(OWNER), &request).await.unwrap();
    assert_eq!(
        booking_status(&store, &op(51)).await.unwrap(),
        Some(BookingStatus::Pending)
    );

    // A stranger's acceptance is logged but does not count.
    let stranger = event(
        52,
        key(9),
        310,
        EventPayload::BookingAccepted(ResponseRef { request_id: op(51) }),
    );
    process_event(&store, &key(OWNER), &stranger).await.unwrap();
    assert_eq!(
        booking_status(&store, &op(51)).await.unwrap(),
        Some(BookingStatus::Pending)
    );

    let accepted = event(
        53,
        resource_owner,
        320,
        EventPayload::BookingAccepted(ResponseRef { request_id: op(51) }),
    );
    let revoked = event(
        54,
        key(OWNER),
        330,
        EventPayload::BookingRejected(ResponseRef { request_id: op(51) }),
    );
    // Arrival order does not matter, the latest counted response does.
    process_event(&store, &key(OWNER), &revoked).await.unwrap();
    process_event(&store, &key(OWNER), &accepted).await.unwrap();
    assert_eq!(
        booking_status(&store, &op(51)).await.unwrap(),
        Some(BookingStatus::Rejected)
    );
}

#[tokio::test]
async fn test_booking_unknown_resource_is_deferred() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    process_event(&store, &key(OWNER), &create_event(20, key(OWNER), 200))
        .await
        .unwrap();
    let request = event(
        51,
        key(3),
        300,
        EventPayload::BookingRequested(BookingRequested {
            calendar_id: op(CALENDAR),
            event_id: op(20),
            resource_id: op(50),
            message: None,
        }),
    );
    assert!(matches!(
        process_event(&store, &key(OWNER), &request).await,
        Err(ProcessError::MissingDependency(_))
    ));
}

#[tokio::test]
async fn test_event_creation_registers_author_log() {
    let store = MemoryStore::new();
    process_event(&store, &key(OWNER), &create_calendar())
        .await
        .unwrap();
    let created = create_event(20, key(4), 200);
    let result = process_event(&store, &key(OWNER), &created).await.unwrap();
    assert_eq!(
        result.effects(),
        &[SyncEffect::AddLogToTopic {
            public_key: key(4),
            topic: Topic::CalendarData(op(CALENDAR)),
            log_id: created.meta.log_path.clone(),
        }]
    );
    let entity = store.entity(EntityKind::Event, &op(20)).await.unwrap().unwrap();
    assert_eq!(entity.calendar_id, op(CALENDAR));
    assert!(matches!(entity.fields, EntityFields::Event(_)));
}
