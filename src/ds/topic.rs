//! Gossip topics and the set of topics a peer is subscribed to.
use std::collections::HashSet;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::CalendarId;

pub const TOPIC_VERSION: &str = "1";
pub const DATA_SUBTOPIC: &str = "data";
pub const INBOX_SUBTOPIC: &str = "inbox";
pub const INVITE_CODES_TOPIC: &str = "/invite-codes/1/rendezvous/json";

/// Rendezvous channel for a data scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Full calendar data: spaces, resources, events, bookings.
    CalendarData(CalendarId),
    /// Access requests and responses for a calendar.
    CalendarInbox(CalendarId),
    /// Well-known ephemeral channel for invite-code resolution.
    InviteCodes,
}

impl Display for Topic {
    /// Content-topic style: `/{calendar}/{version}/{subtopic}/json`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::CalendarData(id) => write!(f, "/{id}/{TOPIC_VERSION}/{DATA_SUBTOPIC}/json"),
            Topic::CalendarInbox(id) => write!(f, "/{id}/{TOPIC_VERSION}/{INBOX_SUBTOPIC}/json"),
            Topic::InviteCodes => write!(f, "{INVITE_CODES_TOPIC}"),
        }
    }
}

/// Topics this peer already subscribed to, so repeated effects subscribe once.
#[derive(Default, Debug)]
pub struct SubscriptionSet {
    set: RwLock<HashSet<Topic>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the topic was not in the set yet.
    pub async fn insert(&self, topic: Topic) -> bool {
        self.set.write().await.insert(topic)
    }

    /// Forget a topic, e.g. after a failed subscribe call.
    pub async fn remove(&self, topic: &Topic) {
        self.set.write().await.remove(topic);
    }

    #[inline]
    pub async fn contains(&self, topic: &Topic) -> bool {
        self.set.read().await.contains(topic)
    }

    pub async fn snapshot(&self) -> Vec<Topic> {
        self.set.read().await.iter().cloned().collect()
    }
}
