//! Debounced replay of topics whose events are missing a prerequisite.
//!
//! An event that fails its causal check stays unacknowledged. Instead of
//! failing, the resolver asks the node to replay the event's topic once the
//! topic has been quiet for the debounce window, so that a burst of
//! out-of-order deliveries costs a single replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ds::{Node, Topic};

type Timers = HashMap<Topic, (u64, JoinHandle<()>)>;

pub struct DependencyResolver<N: Node> {
    node: Arc<N>,
    debounce: Duration,
    timers: Arc<Mutex<Timers>>,
    generation: Mutex<u64>,
}

impl<N: Node> DependencyResolver<N> {
    pub fn new(node: Arc<N>, debounce: Duration) -> Self {
        Self {
            node,
            debounce,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: Mutex::new(0),
        }
    }

    /// Schedule a replay of `topic`, pushing back any replay already
    /// scheduled for it (trailing debounce).
    pub fn trigger(&self, topic: Topic) {
        let generation = {
            let mut generation = lock(&self.generation);
            *generation += 1;
            *generation
        };

        let mut timers = lock(&self.timers);
        let handle = {
            let node = self.node.clone();
            let timers = self.timers.clone();
            let topic = topic.clone();
            let debounce = self.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                {
                    let mut timers = lock(&timers);
                    if timers.get(&topic).is_some_and(|(g, _)| *g == generation) {
                        timers.remove(&topic);
                    }
                }
                debug!("[replay]: replaying {topic}");
                if let Err(e) = node.replay(&topic).await {
                    warn!("[replay]: replay of {topic} failed: {e}");
                }
            })
        };
        if let Some((_, previous)) = timers.insert(topic, (generation, handle)) {
            previous.abort();
        }
    }

    /// Number of topics with a replay scheduled.
    pub fn scheduled(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Cancel every scheduled replay.
    pub fn shutdown(&self) {
        for (topic, (_, handle)) in lock(&self.timers).drain() {
            debug!("[shutdown]: cancelling replay of {topic}");
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Hash, PublicKey};
    use crate::ds::MemoryHub;

    fn topic(byte: u8) -> Topic {
        Topic::CalendarData(Hash::from_bytes([byte; 32]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_coalesce_into_one_replay() {
        let hub = MemoryHub::new();
        let (node, _rx) = hub.join(PublicKey::from_bytes([1; 32]));
        let node = Arc::new(node);
        let resolver = DependencyResolver::new(node.clone(), Duration::from_millis(500));

        resolver.trigger(topic(1));
        tokio::time::sleep(Duration::from_millis(300)).await;
        resolver.trigger(topic(1));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(node.replays().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node.replays().len(), 1);
        assert_eq!(resolver.scheduled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topics_debounce_independently() {
        let hub = MemoryHub::new();
        let (node, _rx) = hub.join(PublicKey::from_bytes([1; 32]));
        let node = Arc::new(node);
        let resolver = DependencyResolver::new(node.clone(), Duration::from_millis(500));

        resolver.trigger(topic(1));
        resolver.trigger(topic(2));
        assert_eq!(resolver.scheduled(), 2);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let replayed: Vec<Topic> = node.replays().into_iter().map(|(t, _)| t).collect();
        assert_eq!(replayed.len(), 2);
        assert!(replayed.contains(&topic(1)));
        assert!(replayed.contains(&topic(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_scheduled_replays() {
        let hub = MemoryHub::new();
        let (node, _rx) = hub.join(PublicKey::from_bytes([1; 32]));
        let node = Arc::new(node);
        let resolver = DependencyResolver::new(node.clone(), Duration::from_millis(500));

        resolver.trigger(topic(1));
        resolver.shutdown();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(node.replays().is_empty());
    }
}
