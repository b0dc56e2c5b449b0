//! In-memory Store
//!
//! Single-process `CoordinationStore` with etcd-like semantics: monotonically
//! increasing revisions, leases that expire on tokio time unless refreshed,
//! prefix watches that can replay from a revision. Fault hooks let tests cut
//! keep-alives, break watches, or make the whole store unreachable.
//!
//! Meant for tests. Every write is one revision, and a lease revoke or expiry
//! deletes all of its keys under a single revision. Watch history keeps the
//! last `DEFAULT_HISTORY_LIMIT` events; replaying from an older revision fails
//! as a compacted etcd watch would.

use super::{
    CoordinationStore, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, Snapshot, WatchEvent,
    WatchSubscription,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

type WatchItem = Result<Vec<WatchEvent>>;

/// Events retained for watch replay.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// In-memory coordination store; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

struct Inner {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    last_lease_id: LeaseId,
    revision: i64,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    /// Highest revision dropped from `history`
    compacted: i64,
    watchers: Vec<Watcher>,
    unavailable: bool,
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
    severed: bool,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchItem>,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::Unavailable)
        } else {
            Ok(())
        }
    }

    fn put_key(&mut self, key: &str, value: &str, lease: Option<LeaseId>) {
        let previous = self.kvs.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );

        if let Some(old_lease) = previous.and_then(|entry| entry.lease) {
            if Some(old_lease) != lease {
                if let Some(l) = self.leases.get_mut(&old_lease) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(l) = lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.insert(key.to_string());
        }

        self.revision += 1;
        let event = WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
            revision: self.revision,
        };
        self.commit(vec![event]);
    }

    fn delete_key(&mut self, key: &str) -> bool {
        if !self.kvs.contains_key(key) {
            return false;
        }

        self.revision += 1;
        let event = self.remove_key(key, self.revision);
        self.commit(event.into_iter().collect());
        true
    }

    fn remove_key(&mut self, key: &str, revision: i64) -> Option<WatchEvent> {
        let entry = self.kvs.remove(key)?;
        if let Some(l) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.remove(key);
        }
        Some(WatchEvent::Delete {
            key: key.to_string(),
            revision,
        })
    }

    /// Drop a lease and every key bound to it in one revision.
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        if lease.keys.is_empty() {
            return true;
        }

        self.revision += 1;
        let revision = self.revision;
        let events = lease
            .keys
            .iter()
            .filter_map(|key| self.remove_key(key, revision))
            .collect();
        self.commit(events);
        true
    }

    /// Deliver one revision's events to matching watchers and record them.
    fn commit(&mut self, events: Vec<WatchEvent>) {
        self.watchers.retain(|watcher| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|event| event.key().starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if batch.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(batch)).is_ok()
        });

        self.history.extend(events);
        self.compact();
    }

    /// Trim history to the limit without splitting a revision.
    fn compact(&mut self) {
        while self.history.len() > self.history_limit {
            if let Some(event) = self.history.pop_front() {
                self.compacted = event.revision();
            }
        }
        while self
            .history
            .front()
            .is_some_and(|event| event.revision() <= self.compacted)
        {
            self.history.pop_front();
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping at most `limit` events for watch replay.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                last_lease_id: 0,
                revision: 0,
                history: VecDeque::new(),
                history_limit: limit,
                compacted: 0,
                watchers: Vec::new(),
                unavailable: false,
            })),
        }
    }

    /// Make every store operation fail with `Error::Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// End the keep-alive stream of a lease without revoking it.
    ///
    /// The lease then expires once its TTL lapses.
    pub async fn sever_keepalive(&self, lease: LeaseId) {
        if let Some(l) = self.inner.lock().await.leases.get_mut(&lease) {
            l.severed = true;
        }
    }

    /// Terminate every open watch with an error.
    pub async fn break_watches(&self) {
        let mut inner = self.inner.lock().await;
        for watcher in inner.watchers.drain(..) {
            let _ = watcher.tx.send(Err(Error::Unavailable));
        }
    }

    /// Delete a key directly, as an operator would.
    pub async fn delete(&self, key: &str) -> bool {
        self.inner.lock().await.delete_key(key)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .kvs
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub async fn lease_count(&self) -> usize {
        self.inner.lock().await.leases.len()
    }

    pub async fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.watchers.retain(|watcher| !watcher.tx.is_closed());
        inner.watchers.len()
    }

    pub async fn revision(&self) -> i64 {
        self.inner.lock().await.revision
    }
}

/// Expire `id` once its deadline passes without a refresh.
async fn reap_when_expired(inner: Weak<Mutex<Inner>>, id: LeaseId) {
    loop {
        let deadline = {
            let Some(store) = inner.upgrade() else {
                return;
            };
            let guard = store.lock().await;
            match guard.leases.get(&id) {
                Some(lease) => lease.deadline,
                None => return,
            }
        };

        tokio::time::sleep_until(deadline).await;

        let Some(store) = inner.upgrade() else {
            return;
        };
        let mut guard = store.lock().await;
        let expired = match guard.leases.get(&id) {
            Some(lease) => Instant::now() >= lease.deadline,
            None => return,
        };
        if expired {
            guard.drop_lease(id);
            debug!(lease_id = id, "Lease expired");
            return;
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        if ttl < 1 {
            return Err(Error::InvalidConfig(format!("lease ttl must be positive, got {ttl}")));
        }

        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        inner.last_lease_id += 1;
        let id = inner.last_lease_id;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + Duration::from_secs(ttl as u64),
                keys: BTreeSet::new(),
                severed: false,
            },
        );
        drop(inner);

        tokio::spawn(reap_when_expired(Arc::downgrade(&self.inner), id));
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        if let Some(id) = lease {
            if !inner.leases.contains_key(&id) {
                return Err(Error::LeaseNotFound(id));
            }
        }
        inner.put_key(key, value, lease);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let inner = self.inner.lock().await;
        inner.check_available()?;

        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();

        Ok(Snapshot {
            kvs,
            revision: inner.revision,
        })
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> Result<Box<dyn KeepAliveStream>> {
        {
            let inner = self.inner.lock().await;
            inner.check_available()?;
            if !inner.leases.contains_key(&lease) {
                return Err(Error::LeaseNotFound(lease));
            }
        }

        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        Ok(Box::new(MemoryKeepAlive {
            store: self.clone(),
            lease_id: lease,
            interval,
        }))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        if inner.drop_lease(lease) {
            Ok(())
        } else {
            Err(Error::LeaseNotFound(lease))
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<Box<dyn WatchSubscription>> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        if start_revision > 0 && start_revision <= inner.compacted {
            return Err(Error::WatchCanceled(format!(
                "required revision {start_revision} has been compacted (compact revision {})",
                inner.compacted
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if start_revision > 0 {
            let replay: Vec<WatchEvent> = inner
                .history
                .iter()
                .filter(|event| event.revision() >= start_revision)
                .filter(|event| event.key().starts_with(prefix))
                .cloned()
                .collect();
            if !replay.is_empty() {
                let _ = tx.send(Ok(replay));
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Box::new(MemoryWatch { rx: Some(rx) }))
    }
}

struct MemoryKeepAlive {
    store: MemoryStore,
    lease_id: LeaseId,
    interval: Interval,
}

#[async_trait]
impl KeepAliveStream for MemoryKeepAlive {
    async fn next_ack(&mut self) -> Result<Option<KeepAliveAck>> {
        self.interval.tick().await;

        let mut inner = self.store.inner.lock().await;
        inner.check_available()?;

        match inner.leases.get_mut(&self.lease_id) {
            Some(lease) if !lease.severed => {
                lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);
                Ok(Some(KeepAliveAck {
                    lease_id: self.lease_id,
                    ttl: lease.ttl,
                }))
            }
            _ => Ok(None),
        }
    }
}

struct MemoryWatch {
    rx: Option<mpsc::UnboundedReceiver<WatchItem>>,
}

#[async_trait]
impl WatchSubscription for MemoryWatch {
    async fn next_batch(&mut self) -> Result<Option<Vec<WatchEvent>>> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => {
                self.rx = None;
                Err(e)
            }
            None => {
                self.rx = None;
                Ok(None)
            }
        }
    }

    async fn cancel(&mut self) {
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "/grpclb/echo/";

    #[tokio::test]
    async fn test_prefix_read_only_returns_prefix() {
        let store = MemoryStore::new();
        store.put("/grpclb/echo/a:1", "1", None).await.unwrap();
        store.put("/grpclb/echo/b:2", "2", None).await.unwrap();
        store.put("/grpclb/echoes/c:3", "3", None).await.unwrap();

        let snapshot = store.get_prefix(PREFIX).await.unwrap();
        let keys: Vec<&str> = snapshot.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/grpclb/echo/a:1", "/grpclb/echo/b:2"]);
        assert_eq!(snapshot.revision, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keepalive() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(5).await.unwrap();
        store.put("/grpclb/echo/a:1", "1", Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.get("/grpclb/echo/a:1").await.is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get("/grpclb/echo/a:1").await.is_none());
        assert_eq!(store.lease_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_refreshes_lease() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(3).await.unwrap();
        store.put("/grpclb/echo/a:1", "1", Some(lease)).await.unwrap();

        let mut keepalive = store.keep_alive(lease, Duration::from_secs(1)).await.unwrap();
        for _ in 0..10 {
            let ack = keepalive.next_ack().await.unwrap().unwrap();
            assert_eq!(ack.lease_id, lease);
            assert_eq!(ack.ttl, 3);
        }
        assert!(store.get("/grpclb/echo/a:1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_severed_keepalive_ends_stream() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(3).await.unwrap();
        let mut keepalive = store.keep_alive(lease, Duration::from_secs(1)).await.unwrap();

        store.sever_keepalive(lease).await;
        assert!(keepalive.next_ack().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys_and_notifies() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(30).await.unwrap();
        store.put("/grpclb/echo/a:1", "1", Some(lease)).await.unwrap();
        let mut watch = store.watch_prefix(PREFIX, 0).await.unwrap();

        store.revoke(lease).await.unwrap();

        assert!(store.get("/grpclb/echo/a:1").await.is_none());
        let batch = watch.next_batch().await.unwrap().unwrap();
        assert_eq!(
            batch,
            vec![WatchEvent::Delete {
                key: "/grpclb/echo/a:1".into(),
                revision: 2,
            }]
        );
        assert!(matches!(
            store.revoke(lease).await,
            Err(Error::LeaseNotFound(id)) if id == lease
        ));
    }

    #[tokio::test]
    async fn test_revoke_deletes_all_keys_in_one_revision() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(30).await.unwrap();
        store.put("/grpclb/echo/a:1", "1", Some(lease)).await.unwrap();
        store.put("/grpclb/echo/b:2", "2", Some(lease)).await.unwrap();
        let mut watch = store.watch_prefix(PREFIX, 0).await.unwrap();

        store.revoke(lease).await.unwrap();

        let batch = watch.next_batch().await.unwrap().unwrap();
        assert_eq!(
            batch,
            vec![
                WatchEvent::Delete {
                    key: "/grpclb/echo/a:1".into(),
                    revision: 3,
                },
                WatchEvent::Delete {
                    key: "/grpclb/echo/b:2".into(),
                    revision: 3,
                },
            ]
        );
        assert_eq!(store.revision().await, 3);
    }

    #[tokio::test]
    async fn test_history_is_compacted() {
        let store = MemoryStore::with_history_limit(4);
        for i in 0..10 {
            store
                .put(&format!("/grpclb/echo/n:{i}"), "1", None)
                .await
                .unwrap();
        }

        assert!(matches!(
            store.watch_prefix(PREFIX, 1).await,
            Err(Error::WatchCanceled(_))
        ));

        let mut watch = store.watch_prefix(PREFIX, 7).await.unwrap();
        let batch = watch.next_batch().await.unwrap().unwrap();
        let revisions: Vec<i64> = batch.iter().map(WatchEvent::revision).collect();
        assert_eq!(revisions, vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let store = MemoryStore::new();
        store.put("/grpclb/echo/a:1", "1", None).await.unwrap();
        let snapshot = store.get_prefix(PREFIX).await.unwrap();
        store.put("/grpclb/echo/b:2", "2", None).await.unwrap();
        store.put("/grpclb/other/c:3", "3", None).await.unwrap();

        let mut watch = store
            .watch_prefix(PREFIX, snapshot.revision + 1)
            .await
            .unwrap();
        let batch = watch.next_batch().await.unwrap().unwrap();
        assert_eq!(
            batch,
            vec![WatchEvent::Put {
                key: "/grpclb/echo/b:2".into(),
                value: "2".into(),
                revision: 2,
            }]
        );
    }

    #[tokio::test]
    async fn test_cancel_and_break_watch() {
        let store = MemoryStore::new();
        let mut canceled = store.watch_prefix(PREFIX, 0).await.unwrap();
        let mut broken = store.watch_prefix(PREFIX, 0).await.unwrap();
        assert_eq!(store.watcher_count().await, 2);

        canceled.cancel().await;
        assert!(canceled.next_batch().await.unwrap().is_none());
        assert_eq!(store.watcher_count().await, 1);

        store.break_watches().await;
        assert!(broken.next_batch().await.is_err());
        assert!(broken.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_requests() {
        let store = MemoryStore::new();
        store.set_unavailable(true).await;

        assert!(matches!(store.grant_lease(5).await, Err(Error::Unavailable)));
        assert!(matches!(store.get_prefix(PREFIX).await, Err(Error::Unavailable)));

        store.set_unavailable(false).await;
        assert!(store.get_prefix(PREFIX).await.is_ok());
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.put("/grpclb/echo/a:1", "1", Some(42)).await,
            Err(Error::LeaseNotFound(42))
        ));
    }
}
