//! Stamped TTL caches for balances, order books and markets
//!
//! Each cache is a value (or key -> value map) with a freshness stamp and a
//! single refresh path. Mutating operations on the same pair invalidate
//! eagerly; readers otherwise tolerate data up to the TTL.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Stamped<V> {
    value: V,
    stamped_at: Instant,
}

/// Single cached value with a TTL
pub struct TtlCell<V> {
    ttl: Duration,
    slot: Mutex<Option<Stamped<V>>>,
}

impl<V: Clone> TtlCell<V> {
    pub fn new(ttl: Duration) -> Self {
        TtlCell {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached value if it is still fresh
    pub async fn get(&self) -> Option<V> {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .filter(|s| s.stamped_at.elapsed() < self.ttl)
            .map(|s| s.value.clone())
    }

    pub async fn put(&self, value: V) {
        let mut slot = self.slot.lock().await;
        *slot = Some(Stamped {
            value,
            stamped_at: Instant::now(),
        });
    }

    /// Drops the cached value so the next read refreshes
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        *slot = None;
    }
}

/// Keyed TTL cache
pub struct TtlMap<K, V> {
    ttl: Duration,
    map: Mutex<HashMap<K, Stamped<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        TtlMap {
            ttl,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let map = self.map.lock().await;
        map.get(key)
            .filter(|s| s.stamped_at.elapsed() < self.ttl)
            .map(|s| s.value.clone())
    }

    pub async fn put(&self, key: K, value: V) {
        let mut map = self.map.lock().await;
        map.insert(
            key,
            Stamped {
                value,
                stamped_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, key: &K) {
        let mut map = self.map.lock().await;
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_cell_fresh_and_expired() {
        let cell = TtlCell::new(Duration::from_millis(40));
        assert_eq!(cell.get().await, None::<u32>);

        cell.put(7).await;
        assert_eq!(cell.get().await, Some(7));

        sleep(Duration::from_millis(60)).await;
        assert_eq!(cell.get().await, None);
    }

    #[tokio::test]
    async fn test_cell_invalidate() {
        let cell = TtlCell::new(Duration::from_secs(60));
        cell.put("snapshot").await;
        cell.invalidate().await;
        assert_eq!(cell.get().await, None);
    }

    #[tokio::test]
    async fn test_map_per_key() {
        let map = TtlMap::new(Duration::from_secs(60));
        map.put("BTC/USDT", 1u32).await;
        map.put("ETH/USDT", 2u32).await;

        map.invalidate(&"BTC/USDT").await;
        assert_eq!(map.get(&"BTC/USDT").await, None);
        assert_eq!(map.get(&"ETH/USDT").await, Some(2));
    }
}
