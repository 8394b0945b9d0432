//! In-process store backend.
//!
//! All data is lost when the process exits. Used for single-instance
//! deployments and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{SharedStore, StoreError};

enum Data {
    Text(String),
    List(VecDeque<String>),
}

struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// A message delivered through [`MemoryStore::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub channel: String,
    pub message: String,
}

/// In-memory [`SharedStore`].
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    tx: broadcast::Sender<PublishedMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            tx,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive everything published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.tx.subscribe()
    }

    /// Drop expired keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key '{key}'"))
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries();
        match entries.get(key) {
            Some(e) if e.is_live(now) => match &e.data {
                Data::Text(s) => Ok(Some(s.clone())),
                Data::List(_) => Err(wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries().insert(
            key.to_string(),
            Entry {
                data: Data::Text(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        if entries.get(key).map(|e| e.is_live(now)).unwrap_or(false) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                data: Data::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries()
            .remove(key)
            .map(|e| e.is_live(now))
            .unwrap_or(false))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        let matches = matches!(
            entries.get(key),
            Some(Entry { data: Data::Text(v), expires_at }) if v == expected
                && expires_at.map(|at| at > now).unwrap_or(true)
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<(u64, Duration), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        let live = entries.get(key).map(|e| e.is_live(now)).unwrap_or(false);
        if !live {
            entries.insert(
                key.to_string(),
                Entry {
                    data: Data::Text("1".into()),
                    expires_at: Some(now + ttl),
                },
            );
            return Ok((1, ttl));
        }

        let entry = entries.get_mut(key).ok_or_else(|| wrong_type(key))?;
        let count = match &entry.data {
            Data::Text(s) => s
                .parse::<u64>()
                .map_err(|_| StoreError::Command(format!("value at '{key}' is not an integer")))?
                + 1,
            Data::List(_) => return Err(wrong_type(key)),
        };
        entry.data = Data::Text(count.to_string());
        let expires_at = *entry.expires_at.get_or_insert(now + ttl);
        Ok((count, expires_at.saturating_duration_since(now)))
    }

    async fn list_push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            data: Data::List(VecDeque::new()),
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                data: Data::List(VecDeque::new()),
                expires_at: None,
            };
        }
        match &mut entry.data {
            Data::List(list) => {
                list.push_front(value.to_string());
                list.truncate(max_len);
                Ok(())
            }
            Data::Text(_) => Err(wrong_type(key)),
        }
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries();
        match entries.get(key) {
            Some(e) if e.is_live(now) => match &e.data {
                Data::List(list) => Ok(list.iter().take(limit).cloned().collect()),
                Data::Text(_) => Err(wrong_type(key)),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        // No subscribers is not an error, same as Redis PUBLISH returning 0.
        let _ = self.tx.send(PublishedMessage {
            channel: channel.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_with_ttl() {
        let store = MemoryStore::new();
        store.set("a", "1", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn set_nx_only_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", "t1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx("lock", "t2", Duration::from_secs(5)).await.unwrap());
        assert!(!store.delete_if_equals("lock", "t2").await.unwrap());
        assert!(store.delete_if_equals("lock", "t1").await.unwrap());
        assert!(store.set_nx("lock", "t2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_after_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", "t1", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.set_nx("lock", "t2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn incr_sets_expiry_on_first_increment() {
        let store = MemoryStore::new();
        let (c1, ttl1) = store.incr_with_expiry("rl", Duration::from_secs(60)).await.unwrap();
        let (c2, ttl2) = store.incr_with_expiry("rl", Duration::from_secs(60)).await.unwrap();
        assert_eq!((c1, c2), (1, 2));
        assert_eq!(ttl1, Duration::from_secs(60));
        assert!(ttl2 <= ttl1);
    }

    #[tokio::test]
    async fn incr_restarts_after_window() {
        let store = MemoryStore::new();
        store.incr_with_expiry("rl", Duration::from_millis(10)).await.unwrap();
        store.incr_with_expiry("rl", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (count, _) = store.incr_with_expiry("rl", Duration::from_millis(10)).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn list_push_trim_keeps_newest() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.list_push_trim("h", &i.to_string(), 3).await.unwrap();
        }
        assert_eq!(store.list_range("h", 10).await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(store.list_range("h", 1).await.unwrap(), vec!["4"]);
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.list_push_trim("k", "x", 3).await.is_err());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.publish("reorg:1", "{}").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "reorg:1");
    }
}
