//! Barrier store interface and in-memory implementation.
//!
//! The fork/join barrier only needs a small list protocol: length-returning
//! push, push-only-if-exists, blocking right pop with timeout, atomic
//! rename, range read, delete, and per-key expiration. Production deploys
//! point this trait at an external store; `MemoryStore` backs tests and
//! local smoke runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::prelude::{Engine, BASE64_STANDARD};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Connection settings for the barrier store, carried inside `$composer`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    /// Base64-encoded TLS certificate authority, when the store needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

impl StoreConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        StoreConfig {
            uri: uri.into(),
            ca: None,
        }
    }

    /// Check the config is usable before any barrier side effect.
    pub fn validate(&self) -> StoreResult<()> {
        if self.uri.is_empty() {
            return Err(StoreError::Message("store uri is empty".to_owned()));
        }
        self.ca_bytes()?;
        Ok(())
    }

    /// Decoded CA bytes, if one was supplied.
    pub fn ca_bytes(&self) -> StoreResult<Option<Vec<u8>>> {
        match &self.ca {
            Some(encoded) => BASE64_STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|err| StoreError::Message(format!("invalid store ca: {err}"))),
            None => Ok(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// List operations the barrier requires of its store.
pub trait BarrierStore: Send + Sync {
    /// Push a value at the head of `key`, creating it; returns the new
    /// list length.
    fn push<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StoreResult<usize>>;

    /// Push only when `key` already exists; returns the new list length,
    /// or 0 when the key was absent.
    fn push_existing<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, StoreResult<usize>>;

    /// Pop the tail of `key`, blocking up to `timeout` for one to appear.
    fn pop_back<'a>(
        &'a self,
        key: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, StoreResult<Option<String>>>;

    /// Atomically rename `from` to `to`; fails when `from` is absent.
    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    /// All elements of `key`, head first.
    fn range<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>>;

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, StoreResult<()>>;

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, StoreResult<()>>;
}

/// Builds a store handle from the continuation's config, lazily per
/// activation.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, config: &StoreConfig) -> StoreResult<Arc<dyn BarrierStore>>;
}

#[derive(Default)]
struct Lists {
    entries: HashMap<String, Vec<String>>,
    expirations: HashMap<String, Instant>,
}

impl Lists {
    fn purge(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
            self.expirations.remove(&key);
        }
    }
}

/// In-memory list store with the same observable semantics as the external
/// one: head pushes, tail pops, atomic rename, lazy expiration.
#[derive(Default)]
pub struct MemoryStore {
    lists: Mutex<Lists>,
    notify: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_lists<T>(&self, f: impl FnOnce(&mut Lists) -> T) -> T {
        let mut lists = self.lists.lock().expect("store lock poisoned");
        lists.purge();
        f(&mut lists)
    }
}

impl BarrierStore for MemoryStore {
    fn push<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StoreResult<usize>> {
        Box::pin(async move {
            let len = self.with_lists(|lists| {
                let list = lists.entries.entry(key.to_owned()).or_default();
                list.insert(0, value.to_owned());
                list.len()
            });
            self.notify.notify_waiters();
            Ok(len)
        })
    }

    fn push_existing<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, StoreResult<usize>> {
        Box::pin(async move {
            let len = self.with_lists(|lists| match lists.entries.get_mut(key) {
                Some(list) => {
                    list.insert(0, value.to_owned());
                    list.len()
                }
                None => 0,
            });
            self.notify.notify_waiters();
            Ok(len)
        })
    }

    fn pop_back<'a>(
        &'a self,
        key: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, StoreResult<Option<String>>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let popped =
                    self.with_lists(|lists| lists.entries.get_mut(key).and_then(|list| list.pop()));
                if let Some(value) = popped {
                    return Ok(Some(value));
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(remaining) => return Ok(None),
                }
            }
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let renamed = self.with_lists(|lists| match lists.entries.remove(from) {
                Some(list) => {
                    let expiration = lists.expirations.remove(from);
                    lists.entries.insert(to.to_owned(), list);
                    if let Some(at) = expiration {
                        lists.expirations.insert(to.to_owned(), at);
                    }
                    true
                }
                None => false,
            });
            if !renamed {
                return Err(StoreError::Message(format!("no such key: {from}")));
            }
            self.notify.notify_waiters();
            Ok(())
        })
    }

    fn range<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move {
            Ok(self.with_lists(|lists| lists.entries.get(key).cloned().unwrap_or_default()))
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with_lists(|lists| {
                for key in keys {
                    lists.entries.remove(key);
                    lists.expirations.remove(key);
                }
            });
            Ok(())
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with_lists(|lists| {
                if lists.entries.contains_key(key) {
                    lists
                        .expirations
                        .insert(key.to_owned(), Instant::now() + ttl);
                }
            });
            Ok(())
        })
    }
}

/// Connector handing out one shared in-memory store regardless of uri.
#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        MemoryConnector { store }
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(&self, config: &StoreConfig) -> StoreResult<Arc<dyn BarrierStore>> {
        config.validate()?;
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_returns_length_and_pop_takes_the_tail() {
        let store = MemoryStore::new();
        assert_eq!(store.push("k", "first").await.expect("push"), 1);
        assert_eq!(store.push("k", "second").await.expect("push"), 2);
        let value = store
            .pop_back("k", Duration::from_millis(10))
            .await
            .expect("pop");
        assert_eq!(value.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn push_existing_rejects_absent_keys() {
        let store = MemoryStore::new();
        assert_eq!(store.push_existing("k", "v").await.expect("push"), 0);
        store.push("k", "v").await.expect("push");
        assert_eq!(store.push_existing("k", "w").await.expect("push"), 2);
    }

    #[tokio::test]
    async fn pop_back_blocks_until_a_push_arrives() {
        let store = Arc::new(MemoryStore::new());
        let waiter = store.clone();
        let handle =
            tokio::spawn(async move { waiter.pop_back("k", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push("k", "v").await.expect("push");
        let value = handle.await.expect("join").expect("pop");
        assert_eq!(value.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn pop_back_times_out_on_silence() {
        let store = MemoryStore::new();
        let value = store
            .pop_back("k", Duration::from_millis(20))
            .await
            .expect("pop");
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn rename_moves_the_list_and_rejects_missing_sources() {
        let store = MemoryStore::new();
        store.push("a", "v").await.expect("push");
        store.rename("a", "b").await.expect("rename");
        assert_eq!(store.range("b").await.expect("range"), vec!["v".to_owned()]);
        assert!(store.range("a").await.expect("range").is_empty());
        assert!(store.rename("a", "b").await.is_err());
    }

    #[tokio::test]
    async fn expired_keys_reject_conditional_pushes() {
        let store = MemoryStore::new();
        store.push("k", "v").await.expect("push");
        store
            .expire("k", Duration::from_millis(5))
            .await
            .expect("expire");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.push_existing("k", "w").await.expect("push"), 0);
    }

    #[test]
    fn config_validation_checks_uri_and_ca() {
        assert!(StoreConfig::new("").validate().is_err());
        assert!(StoreConfig::new("redis://localhost").validate().is_ok());
        let mut config = StoreConfig::new("rediss://localhost");
        config.ca = Some("!!not-base64!!".to_owned());
        assert!(config.validate().is_err());
        config.ca = Some(BASE64_STANDARD.encode(b"pem bytes"));
        assert!(config.validate().is_ok());
        assert_eq!(
            config.ca_bytes().expect("decode").as_deref(),
            Some(b"pem bytes".as_slice())
        );
    }
}
