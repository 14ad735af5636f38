//! Subscription registry.
//!
//! Copy-on-write index of `(subscriber, topic) -> cadence`. Writers serialize
//! on a mutex and publish a fresh `Arc<Index>`; readers grab the current
//! `Arc` and keep a consistent view for as long as they hold it. The
//! scheduler takes one view per pass, so a concurrent subscribe can never
//! tear a pass.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use argus_core::{Cadence, LocalSinkId, SessionId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

/// Who receives a topic: a remote session or an in-process sink.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Subscriber {
    /// A connected wire session.
    Session(SessionId),
    /// A local render sink (overlay).
    Local(LocalSinkId),
}

impl Subscriber {
    /// Session id, if this is a remote subscriber.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Session(id) => Some(id),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

impl From<SessionId> for Subscriber {
    fn from(id: SessionId) -> Self {
        Self::Session(id)
    }
}

impl From<LocalSinkId> for Subscriber {
    fn from(id: LocalSinkId) -> Self {
        Self::Local(id)
    }
}

/// Immutable subscription index.
#[derive(Clone, Debug, Default)]
pub struct Index {
    by_topic: BTreeMap<String, BTreeMap<Subscriber, Cadence>>,
    generation: u64,
}

impl Index {
    /// Topics with at least one subscriber, in name order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.by_topic.keys().map(String::as_str)
    }

    /// Subscribers of `topic` with their cadence.
    pub fn subscribers(&self, topic: &str) -> Vec<(Subscriber, Cadence)> {
        self.by_topic
            .get(topic)
            .map(|subs| subs.iter().map(|(s, c)| (s.clone(), *c)).collect())
            .unwrap_or_default()
    }

    /// Number of subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.by_topic.get(topic).map_or(0, BTreeMap::len)
    }

    /// Cadence of one subscription.
    pub fn cadence(&self, subscriber: &Subscriber, topic: &str) -> Option<Cadence> {
        self.by_topic.get(topic)?.get(subscriber).copied()
    }

    /// Whether the subscription exists.
    pub fn contains(&self, subscriber: &Subscriber, topic: &str) -> bool {
        self.cadence(subscriber, topic).is_some()
    }

    /// All subscriptions of one subscriber.
    pub fn subscriptions_of(&self, subscriber: &Subscriber) -> Vec<(String, Cadence)> {
        self.by_topic
            .iter()
            .filter_map(|(topic, subs)| subs.get(subscriber).map(|c| (topic.clone(), *c)))
            .collect()
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.by_topic.values().map(BTreeMap::len).sum()
    }

    /// No subscriptions at all.
    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    /// Monotonic counter bumped by every mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Shared subscription registry.
#[derive(Default)]
pub struct SubscriptionRegistry {
    current: RwLock<Arc<Index>>,
    writer: Mutex<()>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent view of the current index.
    pub fn snapshot(&self) -> Arc<Index> {
        self.current.read().clone()
    }

    /// Subscribe, replacing any existing cadence for the same pair.
    ///
    /// Returns the previous cadence when this was a re-subscribe.
    pub fn subscribe(
        &self,
        subscriber: Subscriber,
        topic: &str,
        cadence: Cadence,
    ) -> Option<Cadence> {
        let previous = self.mutate(|index| {
            index
                .by_topic
                .entry(topic.to_owned())
                .or_default()
                .insert(subscriber.clone(), cadence)
        });
        debug!(%subscriber, topic, cadence = cadence.label(), replaced = previous.is_some(), "subscribed");
        previous
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscriber: &Subscriber, topic: &str) -> bool {
        let removed = self.mutate(|index| {
            let Some(subs) = index.by_topic.get_mut(topic) else {
                return false;
            };
            let removed = subs.remove(subscriber).is_some();
            if subs.is_empty() {
                let _ = index.by_topic.remove(topic);
            }
            removed
        });
        if removed {
            debug!(%subscriber, topic, "unsubscribed");
        }
        removed
    }

    /// Subscribers of a topic, with cadence.
    pub fn list_subscribers(&self, topic: &str) -> Vec<(Subscriber, Cadence)> {
        self.snapshot().subscribers(topic)
    }

    /// Remove every subscription of `subscriber`. Returns how many were removed.
    pub fn remove_subscriber(&self, subscriber: &Subscriber) -> usize {
        let removed = self.mutate(|index| {
            let mut removed = 0;
            index.by_topic.retain(|_, subs| {
                if subs.remove(subscriber).is_some() {
                    removed += 1;
                }
                !subs.is_empty()
            });
            removed
        });
        if removed > 0 {
            debug!(%subscriber, removed, "removed all subscriptions");
        }
        removed
    }

    /// Topics with subscribers and their subscriber counts.
    pub fn topics(&self) -> Vec<(String, usize)> {
        let index = self.snapshot();
        index
            .by_topic
            .iter()
            .map(|(topic, subs)| (topic.clone(), subs.len()))
            .collect()
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// No subscriptions at all.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Index) -> R) -> R {
        let _guard = self.writer.lock();
        let mut next = Index::clone(&self.current.read());
        let out = f(&mut next);
        next.generation += 1;
        *self.current.write() = Arc::new(next);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn session(n: u32) -> Subscriber {
        Subscriber::Session(SessionId::from(format!("ses_{n}")))
    }

    #[test]
    fn subscribe_and_list() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.subscribe(session(1), "health", Cadence::OnChange).is_none());
        assert!(reg.subscribe(session(2), "health", Cadence::EveryTick).is_none());
        let subs = reg.list_subscribers("health");
        assert_eq!(subs.len(), 2);
        assert!(subs.contains(&(session(1), Cadence::OnChange)));
        assert!(reg.list_subscribers("perf").is_empty());
    }

    #[test]
    fn resubscribe_replaces_cadence() {
        let reg = SubscriptionRegistry::new();
        let _ = reg.subscribe(session(1), "health", Cadence::EveryTick);
        let previous = reg.subscribe(session(1), "health", Cadence::Throttled { per_second: 2 });
        assert_eq!(previous, Some(Cadence::EveryTick));
        assert_eq!(
            reg.list_subscribers("health"),
            vec![(session(1), Cadence::Throttled { per_second: 2 })]
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unsubscribe_prunes_empty_topics() {
        let reg = SubscriptionRegistry::new();
        let _ = reg.subscribe(session(1), "health", Cadence::EveryTick);
        assert!(reg.unsubscribe(&session(1), "health"));
        assert!(!reg.unsubscribe(&session(1), "health"));
        assert!(reg.topics().is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_subscriber_clears_all_topics() {
        let reg = SubscriptionRegistry::new();
        for topic in ["health", "perf", "clock"] {
            let _ = reg.subscribe(session(1), topic, Cadence::EveryTick);
        }
        let _ = reg.subscribe(session(2), "perf", Cadence::OnChange);
        assert_eq!(reg.remove_subscriber(&session(1)), 3);
        assert_eq!(reg.topics(), vec![("perf".to_string(), 1)]);
        assert_eq!(reg.remove_subscriber(&session(1)), 0);
    }

    #[test]
    fn snapshot_is_stable_across_writes() {
        let reg = SubscriptionRegistry::new();
        let _ = reg.subscribe(session(1), "health", Cadence::EveryTick);
        let view = reg.snapshot();
        let _ = reg.subscribe(session(2), "health", Cadence::EveryTick);
        let _ = reg.remove_subscriber(&session(1));
        assert_eq!(view.subscriber_count("health"), 1);
        assert!(view.contains(&session(1), "health"));
        assert!(reg.snapshot().generation() > view.generation());
    }

    #[test]
    fn local_and_session_subscribers_coexist() {
        let reg = SubscriptionRegistry::new();
        let local = Subscriber::Local(LocalSinkId::new());
        let _ = reg.subscribe(local.clone(), "health", Cadence::OnChange);
        let _ = reg.subscribe(session(1), "health", Cadence::EveryTick);
        let view = reg.snapshot();
        assert_eq!(view.subscriptions_of(&local), vec![("health".into(), Cadence::OnChange)]);
        assert!(local.session_id().is_none());
        assert_eq!(session(1).session_id().map(|s| s.as_str()), Some("ses_1"));
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let reg = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let reg = reg.clone();
                thread::spawn(move || {
                    for t in 0..50 {
                        let _ = reg.subscribe(session(n), &format!("topic-{t}"), Cadence::EveryTick);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 8 * 50);
        assert_eq!(reg.snapshot().generation(), 8 * 50);
    }

    #[test]
    fn subscriber_serializes_tagged() {
        let v = serde_json::to_value(session(3)).unwrap();
        assert_eq!(v, serde_json::json!({"type": "session", "id": "ses_3"}));
    }
}
