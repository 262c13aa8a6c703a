//! One lock-protected slice of a cache tier.

use std::borrow::Borrow;
use std::hash::Hash;
use std::time::Instant;

use hashbrown::HashMap;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Result of a single-key read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup<V> {
    Hit(V),
    Miss,
    /// Present but past its TTL; removed by the read.
    Expired,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SweepOutcome {
    pub(crate) expired: usize,
    pub(crate) shrunk: bool,
}

/// TTL map with explicit capacity management.
///
/// `capacity` is the logical size the map is provisioned for. It doubles
/// once occupancy reaches `grow_pct` and halves (never below the initial
/// capacity) after a sweep leaves occupancy under `shrink_pct`.
#[derive(Debug)]
pub(crate) struct TtlShard<K, V> {
    map: HashMap<K, Entry<V>>,
    capacity: usize,
    min_capacity: usize,
    grow_pct: usize,
    shrink_pct: usize,
}

impl<K: Eq + Hash, V: Clone> TtlShard<K, V> {
    pub(crate) fn new(capacity: usize, grow_pct: u8, shrink_pct: u8) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            capacity,
            min_capacity: capacity,
            grow_pct: usize::from(grow_pct),
            shrink_pct: usize::from(shrink_pct),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn get<Q>(&mut self, key: &Q, now: Instant) -> Lookup<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(entry) = self.map.get(key) else {
            return Lookup::Miss;
        };
        if entry.expires_at > now {
            return Lookup::Hit(entry.value.clone());
        }
        self.map.remove(key);
        Lookup::Expired
    }

    /// Insert or replace; returns true when the shard grew.
    pub(crate) fn insert(&mut self, key: K, value: V, expires_at: Instant) -> bool {
        self.map.insert(key, Entry { value, expires_at });
        if self.map.len() * 100 >= self.capacity * self.grow_pct {
            self.capacity *= 2;
            let additional = self.capacity.saturating_sub(self.map.len());
            self.map.reserve(additional);
            return true;
        }
        false
    }

    pub(crate) fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key).is_some()
    }

    /// Push back the expiry of a live entry.
    pub(crate) fn extend<Q>(&mut self, key: &Q, now: Instant, expires_at: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = entry.expires_at.max(expires_at);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires_at > now);
        let expired = before - self.map.len();

        let mut shrunk = false;
        while self.capacity > self.min_capacity
            && self.map.len() * 100 < self.capacity * self.shrink_pct
        {
            self.capacity = (self.capacity / 2).max(self.min_capacity);
            shrunk = true;
        }
        if shrunk {
            self.map.shrink_to(self.capacity);
        }
        SweepOutcome { expired, shrunk }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn expired_entries_are_misses() {
        let now = Instant::now();
        let mut shard = TtlShard::new(8, 98, 25);
        shard.insert("a".to_owned(), 1_u32, now + Duration::from_secs(1));
        assert_eq!(shard.get("a", now), Lookup::Hit(1));
        assert_eq!(shard.get("a", now + Duration::from_secs(2)), Lookup::Expired);
        assert_eq!(shard.len(), 0);
        assert_eq!(shard.get("a", now), Lookup::Miss);
    }

    #[test]
    fn grows_near_full_and_shrinks_after_sweep() {
        let now = Instant::now();
        let soon = now + Duration::from_millis(10);
        let mut shard = TtlShard::new(4, 98, 25);
        let mut grew = 0;
        for key in 0..20_u64 {
            if shard.insert(key, key, soon) {
                grew += 1;
            }
        }
        assert!(grew >= 2);
        assert!(shard.capacity() >= 20);

        let outcome = shard.sweep(now + Duration::from_secs(1));
        assert_eq!(outcome.expired, 20);
        assert!(outcome.shrunk);
        assert_eq!(shard.capacity(), 4);
    }

    #[test]
    fn extend_only_touches_live_entries() {
        let now = Instant::now();
        let mut shard = TtlShard::new(4, 98, 25);
        shard.insert(7_u64, (), now + Duration::from_millis(5));
        assert!(shard.extend(&7, now, now + Duration::from_secs(60)));
        assert_eq!(shard.get(&7, now + Duration::from_secs(30)), Lookup::Hit(()));
        assert!(!shard.extend(&8, now, now + Duration::from_secs(60)));
        assert!(!shard.extend(&7, now + Duration::from_secs(120), now + Duration::from_secs(180)));
    }
}
