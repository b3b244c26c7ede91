//! Two peers on one hub: join by invite code, access, and convergent writes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use de_cal::app::{spawn_dispatcher, OperationError, Peer, PeerError};
use de_cal::config::Config;
use de_cal::core::{
    AccessState, BookingStatus, CalendarFields, CalendarId, EntityKind, EventFields, MemoryStore,
    PublicKey, ResourceFields, Role,
};
use de_cal::ds::{MemoryHub, MemoryNode, Topic};

type TestPeer = Peer<MemoryStore, MemoryNode>;

async fn start_peer(hub: &MemoryHub, seed: u8) -> Arc<TestPeer> {
    let (node, inbound) = hub.join(PublicKey::from_bytes([seed; 32]));
    let peer = Arc::new(
        Peer::new(MemoryStore::new(), node, Config::default())
            .await
            .unwrap(),
    );
    spawn_dispatcher(peer.clone(), inbound, peer.cancellation_token());
    peer
}

/// Poll until `check` holds, giving the dispatchers time to run.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn event_fields(name: &str) -> EventFields {
    EventFields {
        name: name.to_string(),
        description: None,
        start: Utc.with_ymd_and_hms(2026, 6, 20, 9, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2026, 6, 20, 17, 0, 0).unwrap(),
        space_id: None,
        resource_ids: Vec::new(),
    }
}

/// Alice owns a calendar and Bob has been accepted into it.
async fn joined_pair() -> (Arc<TestPeer>, Arc<TestPeer>, CalendarId) {
    let hub = MemoryHub::new();
    let alice = start_peer(&hub, 1).await;
    let bob = start_peer(&hub, 2).await;

    let calendar_id = alice
        .create_calendar(CalendarFields {
            name: "Street fair".to_string(),
            start_date: None,
            end_date: None,
        })
        .await
        .unwrap();
    let code = alice.invite_code(&calendar_id).await.unwrap();

    let (resolved, request_id) = bob
        .join_with_invite_code(&code, Some("bob".to_string()))
        .await
        .unwrap();
    assert_eq!(resolved.calendar_id, calendar_id);
    assert_eq!(
        bob.access_state(&calendar_id, &bob.public_key()).await.unwrap(),
        AccessState::Requested
    );

    eventually(|| {
        let alice = alice.clone();
        async move {
            alice
                .access_state(&calendar_id, &PublicKey::from_bytes([2; 32]))
                .await
                .unwrap()
                == AccessState::Requested
        }
    })
    .await;
    alice.accept_access(request_id).await.unwrap();

    eventually(|| {
        let bob = bob.clone();
        async move { bob.has_access(&calendar_id, &bob.public_key()).await.unwrap() }
    })
    .await;
    (alice, bob, calendar_id)
}

#[tokio::test]
async fn test_accepted_peer_syncs_calendar_and_writes() {
    let (alice, bob, calendar_id) = joined_pair().await;

    assert!(bob
        .subscriptions()
        .await
        .contains(&Topic::CalendarData(calendar_id)));
    let calendar = bob.calendar(&calendar_id).await.unwrap().unwrap();
    assert_eq!(calendar.name(), "Street fair");

    let users = alice.users(&calendar_id).await.unwrap();
    let bob_user = users
        .iter()
        .find(|user| user.public_key == bob.public_key())
        .unwrap();
    assert_eq!(bob_user.role, Role::Member);

    let event_id = bob
        .create_event(calendar_id, event_fields("Stalls open"))
        .await
        .unwrap();
    eventually(|| {
        let alice = alice.clone();
        async move {
            alice
                .entity(EntityKind::Event, &event_id)
                .await
                .unwrap()
                .is_some()
        }
    })
    .await;
}

#[tokio::test]
async fn test_member_update_is_rejected_until_promoted() {
    let (alice, bob, calendar_id) = joined_pair().await;

    let err = bob
        .update_calendar(
            calendar_id,
            CalendarFields {
                name: "Bob's fair".to_string(),
                start_date: None,
                end_date: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PeerError::Operation(OperationError::Rejected(_))
    ));

    alice
        .assign_role(calendar_id, bob.public_key(), Role::Admin)
        .await
        .unwrap();
    eventually(|| {
        let bob = bob.clone();
        async move {
            bob.users(&calendar_id)
                .await
                .unwrap()
                .iter()
                .any(|user| user.public_key == bob.public_key() && user.role == Role::Admin)
        }
    })
    .await;

    bob.update_calendar(
        calendar_id,
        CalendarFields {
            name: "Street fair 2026".to_string(),
            start_date: None,
            end_date: None,
        },
    )
    .await
    .unwrap();
    eventually(|| {
        let alice = alice.clone();
        async move {
            alice
                .calendar(&calendar_id)
                .await
                .unwrap()
                .is_some_and(|calendar| calendar.name() == "Street fair 2026")
        }
    })
    .await;
}

#[tokio::test]
async fn test_booking_roundtrip_between_peers() {
    let (alice, bob, calendar_id) = joined_pair().await;

    let resource_id = alice
        .create_resource(
            calendar_id,
            ResourceFields {
                name: "Sound system".to_string(),
                description: None,
            },
        )
        .await
        .unwrap();
    let event_id = bob
        .create_event(calendar_id, event_fields("Concert"))
        .await
        .unwrap();
    eventually(|| {
        let bob = bob.clone();
        async move {
            bob.entity(EntityKind::Resource, &resource_id)
                .await
                .unwrap()
                .is_some()
        }
    })
    .await;

    let request_id = bob
        .request_booking(event_id, resource_id, Some("evening set".to_string()))
        .await
        .unwrap();
    eventually(|| {
        let alice = alice.clone();
        async move { alice.booking_status(&request_id).await.unwrap().is_some() }
    })
    .await;

    alice.accept_booking(request_id).await.unwrap();
    eventually(|| {
        let bob = bob.clone();
        async move {
            bob.booking_status(&request_id).await.unwrap() == Some(BookingStatus::Accepted)
        }
    })
    .await;
}

#[tokio::test]
async fn test_rejected_peer_never_gets_access() {
    let hub = MemoryHub::new();
    let alice = start_peer(&hub, 1).await;
    let carol = start_peer(&hub, 3).await;

    let calendar_id = alice
        .create_calendar(CalendarFields {
            name: "Private".to_string(),
            start_date: None,
            end_date: None,
        })
        .await
        .unwrap();
    let request_id = carol.request_access(calendar_id, None).await.unwrap();

    eventually(|| {
        let alice = alice.clone();
        async move {
            alice
                .access_requests(&calendar_id, &PublicKey::from_bytes([3; 32]))
                .await
                .unwrap()
                .len()
                == 1
        }
    })
    .await;
    alice.reject_access(request_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        alice
            .access_state(&calendar_id, &carol.public_key())
            .await
            .unwrap(),
        AccessState::Rejected
    );
    assert!(carol.calendar(&calendar_id).await.unwrap().is_none());
    assert!(!carol
        .subscriptions()
        .await
        .contains(&Topic::CalendarData(calendar_id)));
}

#[tokio::test]
async fn test_shutdown_rejects_waiting_commands() {
    let hub = MemoryHub::new();
    let (node, _inbound) = hub.join(PublicKey::from_bytes([4; 32]));
    // No dispatcher: the command can only settle through shutdown.
    let peer = Arc::new(
        Peer::new(MemoryStore::new(), node, Config::default())
            .await
            .unwrap(),
    );

    let pending = {
        let peer = peer.clone();
        tokio::spawn(async move {
            peer.create_calendar(CalendarFields {
                name: "Never".to_string(),
                start_date: None,
                end_date: None,
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    peer.shutdown();

    assert!(matches!(
        pending.await.unwrap(),
        Err(PeerError::Operation(OperationError::ShutDown))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commands_complete_on_multi_thread_runtime() {
    let hub = MemoryHub::new();
    let alice = start_peer(&hub, 5).await;

    // The dispatcher may see each event before `publish` returns.
    for round in 0..200 {
        let created = tokio::time::timeout(
            Duration::from_secs(2),
            alice.create_calendar(CalendarFields {
                name: format!("Round {round}"),
                start_date: None,
                end_date: None,
            }),
        )
        .await;
        let calendar_id = created
            .unwrap_or_else(|_| panic!("create_calendar hung in round {round}"))
            .unwrap();
        assert!(alice.calendar(&calendar_id).await.unwrap().is_some());
    }
}
