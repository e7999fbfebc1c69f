//! Subscription registry with per-key fan-out.

use crate::filter::ForwardState;
use crate::types::{Key, SubscriptionId, Update};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::Subscription;

/// Number of key buckets.
const SHARD_COUNT: usize = 16;

/// One subscription watching one key.
struct Binding {
    subscription: Arc<Subscription>,
    state: Mutex<ForwardState>,
}

type Shard = RwLock<HashMap<Key, Vec<Binding>>>;

/// Owns all active subscriptions.
pub struct SubscriptionRegistry {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    /// Bindings bucketed by key hash.
    shards: Vec<Shard>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &Key) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Reserve a fresh identifier. Identifiers are never handed out twice.
    pub fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a subscription under each of its keys.
    pub fn insert(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);

        for key in &subscription.keys {
            self.shard(key)
                .write()
                .entry(*key)
                .or_default()
                .push(Binding {
                    subscription: Arc::clone(&subscription),
                    state: Mutex::new(ForwardState::new()),
                });
        }

        self.subscriptions
            .write()
            .insert(subscription.id, Arc::clone(&subscription));
        subscription
    }

    /// Unregister a subscription. Returns `None` for unknown ids.
    ///
    /// Blocks until no ingestion pass is evaluating the subscription.
    pub fn remove(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let subscription = self.subscriptions.write().remove(&id)?;

        for key in &subscription.keys {
            let mut shard = self.shard(key).write();
            if let Some(bindings) = shard.get_mut(key) {
                bindings.retain(|b| b.subscription.id != id);
                if bindings.is_empty() {
                    shard.remove(key);
                }
            }
        }

        Some(subscription)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(&id).cloned()
    }

    /// Get subscription count.
    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every subscription bound to the update's key and call
    /// `forward` for each one whose filter passes. Returns how many passed.
    ///
    /// `forward` runs while the key's bucket is read-locked; it must only
    /// queue work.
    pub fn fan_out<F>(&self, update: &Update, mut forward: F) -> usize
    where
        F: FnMut(&Subscription),
    {
        let shard = self.shard(&update.key).read();
        let bindings = match shard.get(&update.key) {
            Some(b) => b,
            None => return 0,
        };

        let mut forwarded = 0;
        for binding in bindings {
            let sub = &binding.subscription;
            let pass = binding
                .state
                .lock()
                .apply(sub.filter, sub.sampling, &update.payload);
            if pass {
                forward(sub);
                forwarded += 1;
            }
        }

        debug!(
            key = %update.key,
            candidates = bindings.len(),
            forwarded,
            "fan-out"
        );
        forwarded
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Mailbox;
    use crate::subscriptions::{Delivery, Handler};
    use crate::types::{BusName, FilterMode, FrameData, Timestamp};

    fn subscription(
        registry: &SubscriptionRegistry,
        keys: Vec<Key>,
        filter: FilterMode,
        sampling: u16,
    ) -> Subscription {
        let id = registry.allocate_id();
        Subscription {
            id,
            bus: BusName(0),
            keys,
            filter,
            sampling,
            delivery: Delivery::Queued,
            mailbox: Arc::new(Mailbox::new(
                id,
                Handler::Frame(Arc::new(|_: &FrameData| {})),
                Delivery::Queued,
                8,
                0,
            )),
        }
    }

    fn update(id: u32, byte: u8) -> Update {
        Update::frame(BusName(0), id, Timestamp(0), vec![byte])
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SubscriptionRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fan_out_by_key() {
        let registry = SubscriptionRegistry::new();
        let k1 = Key::frame(BusName(0), 1);
        let k2 = Key::frame(BusName(0), 2);
        let s1 = registry.insert(subscription(&registry, vec![k1], FilterMode::FilterOff, 1));
        let s2 = registry.insert(subscription(&registry, vec![k1, k2], FilterMode::FilterOff, 1));

        let mut seen = Vec::new();
        assert_eq!(registry.fan_out(&update(1, 0), |s| seen.push(s.id)), 2);
        seen.sort();
        assert_eq!(seen, vec![s1.id, s2.id]);

        let mut seen = Vec::new();
        registry.fan_out(&update(2, 0), |s| seen.push(s.id));
        assert_eq!(seen, vec![s2.id]);

        assert_eq!(registry.fan_out(&update(3, 0), |_| {}), 0);
    }

    #[test]
    fn test_independent_filter_state() {
        let registry = SubscriptionRegistry::new();
        let key = Key::frame(BusName(0), 1);
        let on_change = registry.insert(subscription(&registry, vec![key], FilterMode::FilterOnChange, 1));
        let off = registry.insert(subscription(&registry, vec![key], FilterMode::FilterOff, 1));

        let mut counts: HashMap<SubscriptionId, usize> = HashMap::new();
        for byte in [1, 1, 1, 2] {
            registry.fan_out(&update(1, byte), |s| *counts.entry(s.id).or_default() += 1);
        }
        assert_eq!(counts[&on_change.id], 2);
        assert_eq!(counts[&off.id], 4);
    }

    #[test]
    fn test_remove() {
        let registry = SubscriptionRegistry::new();
        let key = Key::frame(BusName(0), 1);
        let sub = registry.insert(subscription(&registry, vec![key], FilterMode::FilterOff, 1));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(sub.id).is_some());
        assert!(registry.remove(sub.id).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.fan_out(&update(1, 0), |_| {}), 0);
    }
}
