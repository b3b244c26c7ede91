//! Two in-process peers: one creates a calendar, the other finds it through
//! its invite code, asks for access and writes to it once accepted.
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use de_cal::app::{spawn_dispatcher, Peer};
use de_cal::config::Config;
use de_cal::core::{CalendarFields, EntityKind, EventFields, MemoryStore, PublicKey};
use de_cal::ds::{MemoryHub, MemoryNode};
use de_cal::logging::init_logging;

type DemoPeer = Peer<MemoryStore, MemoryNode>;

async fn start_peer(hub: &MemoryHub, seed: u8, config: &Config) -> anyhow::Result<Arc<DemoPeer>> {
    let (node, inbound) = hub.join(PublicKey::from_bytes([seed; 32]));
    let peer = Arc::new(Peer::new(MemoryStore::new(), node, config.clone()).await?);
    spawn_dispatcher(peer.clone(), inbound, peer.cancellation_token());
    Ok(peer)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_logging("info");
    let config = Config::from_env().context("Failed to load configuration")?;

    let hub = MemoryHub::new();
    let alice = start_peer(&hub, 1, &config).await?;
    let bob = start_peer(&hub, 2, &config).await?;

    let calendar_id = alice
        .create_calendar(CalendarFields {
            name: "Community Garden".to_string(),
            start_date: None,
            end_date: None,
        })
        .await?;
    let code = alice.invite_code(&calendar_id).await?;
    info!("alice created calendar {calendar_id} with invite code {code}");

    let (calendar, request_id) = bob
        .join_with_invite_code(&code, Some("bob".to_string()))
        .await
        .context("Failed to join calendar")?;
    info!("bob found {:?} and requested access ({request_id})", calendar.name);

    // Alice sees the request once her dispatcher has processed it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.accept_access(request_id).await?;

    let mut synced = false;
    for _ in 0..20 {
        if bob.calendar(&calendar_id).await?.is_some() {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::ensure!(synced, "bob never received the calendar");
    info!(
        "bob has access: {}",
        bob.has_access(&calendar_id, &bob.public_key()).await?
    );

    let start = chrono::Utc::now();
    let event_id = bob
        .create_event(
            calendar_id,
            EventFields {
                name: "Planting day".to_string(),
                description: None,
                start,
                end: start + chrono::Duration::hours(3),
                space_id: None,
                resource_ids: Vec::new(),
            },
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen_by_alice = alice.entity(EntityKind::Event, &event_id).await?.is_some();
    info!("event {event_id} created by bob, visible to alice: {seen_by_alice}");

    alice.shutdown();
    bob.shutdown();
    Ok(())
}
