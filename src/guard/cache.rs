//! Process-scoped cache with idle-TTL eviction.
//!
//! Holds the advisory guard state (rate-limit windows, dedup records,
//! rejected purchases). Contents are lost on restart and may be evicted at
//! any time after the idle TTL, so nothing stored here may be the only
//! record of a financial fact.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    last_access: DateTime<Utc>,
}

impl<V> Slot<V> {
    fn is_idle(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_access > ttl
    }
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    slots: RwLock<HashMap<K, Slot<V>>>,
    idle_ttl: Duration,
}

impl<K: Eq + Hash, V> TtlCache<K, V> {
    pub fn new(idle_ttl: Duration) -> Self {
        TtlCache {
            slots: RwLock::new(HashMap::new()),
            idle_ttl,
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    /// Run `f` on the value for `key`, creating it (or replacing an idle one)
    /// with `V::default()`. Touches the entry.
    pub fn with_entry<R>(&self, key: K, now: DateTime<Utc>, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Default,
    {
        let mut slots = self.slots.write();
        let ttl = self.idle_ttl;
        let slot = slots.entry(key).or_insert_with(|| Slot {
            value: V::default(),
            last_access: now,
        });
        if slot.is_idle(now, ttl) {
            slot.value = V::default();
        }
        slot.last_access = now;
        f(&mut slot.value)
    }

    /// Live value for `key`, without touching it.
    pub fn get(&self, key: &K, now: DateTime<Utc>) -> Option<V>
    where
        V: Clone,
    {
        self.slots
            .read()
            .get(key)
            .filter(|slot| !slot.is_idle(now, self.idle_ttl))
            .map(|slot| slot.value.clone())
    }

    pub fn insert(&self, key: K, value: V, now: DateTime<Utc>) {
        self.slots.write().insert(
            key,
            Slot {
                value,
                last_access: now,
            },
        );
    }

    /// Mutate an existing live entry without touching it.
    pub fn update<R>(&self, key: &K, now: DateTime<Utc>, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut slots = self.slots.write();
        slots
            .get_mut(key)
            .filter(|slot| !slot.is_idle(now, self.idle_ttl))
            .map(|slot| f(&mut slot.value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.slots.write().remove(key).map(|slot| slot.value)
    }

    /// Evict idle entries, then let `keep` prune each remaining value and
    /// decide whether it stays. Returns the number of entries removed.
    pub fn sweep(&self, now: DateTime<Utc>, mut keep: impl FnMut(&mut V) -> bool) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        let ttl = self.idle_ttl;
        slots.retain(|_, slot| !slot.is_idle(now, ttl) && keep(&mut slot.value));
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn clear(&self) {
        self.slots.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_with_entry_creates_and_touches() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::seconds(10));
        assert_eq!(cache.with_entry("a", t(0), |v| { *v += 1; *v }), 1);
        assert_eq!(cache.with_entry("a", t(8), |v| { *v += 1; *v }), 2);
        // touched at t(8), so still live at t(15)
        assert_eq!(cache.get(&"a", t(15)), Some(2));
    }

    #[test]
    fn test_idle_entry_is_reset() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::seconds(10));
        cache.with_entry("a", t(0), |v| *v = 7);
        assert_eq!(cache.get(&"a", t(10)), Some(7));
        assert_eq!(cache.get(&"a", t(11)), None);
        assert_eq!(cache.with_entry("a", t(11), |v| *v), 0);
    }

    #[test]
    fn test_sweep_evicts_idle_and_pruned() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::seconds(10));
        cache.insert("old", 1, t(0));
        cache.insert("empty", 0, t(5));
        cache.insert("live", 3, t(5));
        let removed = cache.sweep(t(12), |v| *v > 0);
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"live", t(12)), Some(3));
    }

    #[test]
    fn test_update_skips_missing_and_idle() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::seconds(10));
        assert_eq!(cache.update(&"a", t(0), |v| *v), None);
        cache.insert("a", 4, t(0));
        assert_eq!(cache.update(&"a", t(5), |v| { *v += 1; *v }), Some(5));
        assert_eq!(cache.update(&"a", t(20), |v| *v), None);
        assert_eq!(cache.remove(&"a"), Some(5));
        assert!(cache.is_empty());
    }
}
