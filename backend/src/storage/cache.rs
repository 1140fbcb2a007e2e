use crate::error::{IngestError, Result};
use crate::storage::SnapshotCache;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// In-process TTL cache holding JSON snapshots.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (Instant, String)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> IngestError {
    IngestError::Resource("snapshot cache lock poisoned".to_string())
}

impl SnapshotCache for MemoryCache {
    fn put(&self, key: &str, json: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), (Instant::now() + ttl, json));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        {
            let entries = self.entries.read().map_err(poisoned)?;
            match entries.get(key) {
                None => return Ok(None),
                Some((expires, json)) if *expires > Instant::now() => {
                    return Ok(Some(json.clone()))
                }
                Some(_) => {}
            }
        }
        // Expired: evict, unless a writer refreshed it in between.
        let mut entries = self.entries.write().map_err(poisoned)?;
        if entries
            .get(key)
            .is_some_and(|(expires, _)| *expires <= Instant::now())
        {
            entries.remove(key);
        }
        Ok(None)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, (expires, _)| *expires > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_their_ttl() {
        let cache = MemoryCache::new();
        cache
            .put("upload:a", "{}".to_string(), Duration::from_secs(60))
            .unwrap();
        cache.put("upload:b", "{}".to_string(), Duration::ZERO).unwrap();

        assert_eq!(cache.get("upload:a").unwrap().as_deref(), Some("{}"));
        assert_eq!(cache.get("upload:b").unwrap(), None);
        assert_eq!(cache.len(), 1, "an expired read evicts the entry");
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let cache = MemoryCache::new();
        cache
            .put("upload:a", "{}".to_string(), Duration::from_secs(60))
            .unwrap();
        for key in ["upload:b", "upload:c"] {
            cache.put(key, "{}".to_string(), Duration::ZERO).unwrap();
        }

        assert_eq!(cache.purge_expired().unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired().unwrap(), 0);
    }

    #[test]
    fn remove_forgets_the_key() {
        let cache = MemoryCache::new();
        cache
            .put("upload:a", "1".to_string(), Duration::from_secs(60))
            .unwrap();
        cache.remove("upload:a").unwrap();
        assert_eq!(cache.get("upload:a").unwrap(), None);
    }
}
