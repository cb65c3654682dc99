use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    tags: Vec<String>,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Reverse index so invalidating a tag touches only the keys carrying it.
    tag_index: HashMap<String, HashSet<K>>,
}

/// TTL cache with tag-based invalidation.
///
/// Every entry carries the set of tags it depends on; `invalidate_tag`
/// removes all entries carrying the tag in one pass. The TTL is a backstop
/// only, invalidation is event-driven. Fills are expected to race: callers
/// read, compute without holding the lock, then insert (last write wins).
pub struct TaggedCache<K, V> {
    ttl: Duration,
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> TaggedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                tag_index: HashMap::new(),
            }),
        }
    }

    /// Look up a live entry. Expired entries are treated as absent and
    /// cleaned up on the next insert or invalidation touching them.
    pub async fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.read().await;
        let entry = inner.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert a value with its dependency tags, replacing any previous entry
    /// for the key (and its old tag links).
    pub async fn insert(&self, key: K, value: V, tags: Vec<String>) {
        let mut inner = self.inner.write().await;
        let expires_at = Instant::now() + self.ttl;
        if let Some(old) = inner.entries.remove(&key) {
            unlink(&mut inner.tag_index, &key, &old.tags);
        }
        for tag in &tags {
            inner
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                tags,
            },
        );
    }

    /// Remove every entry carrying the given tag.
    pub async fn invalidate_tag(&self, tag: &str) {
        let mut inner = self.inner.write().await;
        let Some(keys) = inner.tag_index.remove(tag) else {
            return;
        };
        for key in keys {
            if let Some(entry) = inner.entries.remove(&key) {
                unlink(&mut inner.tag_index, &key, &entry.tags);
            }
        }
    }

    pub async fn invalidate_tags(&self, tags: &[String]) {
        for tag in tags {
            self.invalidate_tag(tag).await;
        }
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.tag_index.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn unlink<K: Eq + Hash>(tag_index: &mut HashMap<String, HashSet<K>>, key: &K, tags: &[String]) {
    for tag in tags {
        if let Some(keys) = tag_index.get_mut(tag) {
            keys.remove(key);
            if keys.is_empty() {
                tag_index.remove(tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TaggedCache<u32, String> {
        TaggedCache::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn insert_and_get() {
        let cache = cache();
        cache.insert(1, "one".into(), vec!["a".into()]).await;
        assert_eq!(cache.get(&1).await, Some("one".to_string()));
        assert_eq!(cache.get(&2).await, None);
    }

    #[tokio::test]
    async fn invalidate_tag_removes_all_carriers() {
        let cache = cache();
        cache.insert(1, "one".into(), vec!["a".into(), "shared".into()]).await;
        cache.insert(2, "two".into(), vec!["b".into(), "shared".into()]).await;
        cache.insert(3, "three".into(), vec!["c".into()]).await;

        cache.invalidate_tag("shared").await;
        assert_eq!(cache.get(&1).await, None);
        assert_eq!(cache.get(&2).await, None);
        assert_eq!(cache.get(&3).await, Some("three".to_string()));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn invalidating_unknown_tag_is_a_no_op() {
        let cache = cache();
        cache.insert(1, "one".into(), vec!["a".into()]).await;
        cache.invalidate_tag("missing").await;
        assert_eq!(cache.get(&1).await, Some("one".to_string()));
    }

    #[tokio::test]
    async fn reinsert_replaces_old_tags() {
        let cache = cache();
        cache.insert(1, "one".into(), vec!["old".into()]).await;
        cache.insert(1, "one v2".into(), vec!["new".into()]).await;

        // The old tag no longer references the key.
        cache.invalidate_tag("old").await;
        assert_eq!(cache.get(&1).await, Some("one v2".to_string()));

        cache.invalidate_tag("new").await;
        assert_eq!(cache.get(&1).await, None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache: TaggedCache<u32, String> = TaggedCache::new(Duration::from_millis(10));
        cache.insert(1, "one".into(), vec![]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&1).await, None);
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let cache = cache();
        cache.insert(1, "one".into(), vec!["a".into()]).await;
        cache.insert(2, "two".into(), vec!["b".into()]).await;
        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
