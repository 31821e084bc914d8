use std::collections::HashMap;

use parking_lot::Mutex;

use crate::strategy::model::StrategyParams;

/// Per-user strategy cache with TTL.
///
/// Guarantees:
/// - an entry is never returned after its TTL elapsed
/// - memory is bounded: expired entries are swept once the map outgrows
///   `max_entries`, and the oldest entry is evicted if that is not enough
pub struct StrategyCache {
    ttl_ms: u64,
    max_entries: usize,
    inner: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    stored_ms: u64,
    params: StrategyParams,
}

impl StrategyCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            max_entries: 10_000,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, user_id: &str, now_ms: u64) -> Option<StrategyParams> {
        let map = self.inner.lock();
        let entry = map.get(user_id)?;
        if now_ms.saturating_sub(entry.stored_ms) >= self.ttl_ms {
            return None;
        }
        Some(entry.params.clone())
    }

    pub fn put(&self, user_id: &str, params: StrategyParams, now_ms: u64) {
        let mut map = self.inner.lock();

        if map.len() >= self.max_entries && !map.contains_key(user_id) {
            let ttl = self.ttl_ms;
            map.retain(|_, e| now_ms.saturating_sub(e.stored_ms) < ttl);

            if map.len() >= self.max_entries {
                if let Some(oldest) = map
                    .iter()
                    .min_by_key(|(_, e)| e.stored_ms)
                    .map(|(k, _)| k.clone())
                {
                    map.remove(&oldest);
                }
            }
        }

        map.insert(
            user_id.to_string(),
            CacheEntry {
                stored_ms: now_ms,
                params,
            },
        );
    }

    pub fn invalidate(&self, user_id: &str) {
        self.inner.lock().remove(user_id);
    }
}
