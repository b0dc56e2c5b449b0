//! Discoverer and Resolver
//!
//! A resolver moves through `Init -> SnapshotLoaded -> Watching -> Closed`:
//! 1. Snapshot: bounded prefix read; failure fails `build`, nothing is spawned
//! 2. Publish the snapshot to the consumer
//! 3. Watch from the snapshot revision + 1 on a background task
//!
//! The address set lives on the watch task and nowhere else. `resolve_now`
//! is a message to that task, so every mutation happens on one task and each
//! publish sees a complete set.
//!
//! If the watch stream ends on its own the resolver goes `Inert` and keeps
//! serving its last state. A `resolve_now` request, or the elapsed
//! `DiscoveryConfig::rewatch_delay` when set, re-snapshots and re-watches.

use crate::config::DiscoveryConfig;
use crate::consumer::Consumer;
use crate::target::Target;
use grpclb_core::observability::{events, metrics};
use grpclb_core::{
    AddressEntry, AddressSet, CoordinationStore, EtcdStore, Error, Result, Snapshot, StoreConfig,
    WatchEvent, WatchSubscription, SCHEMA,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Resolver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverPhase {
    /// Created, nothing read yet
    Init,
    /// Initial snapshot published, watch not yet established
    SnapshotLoaded,
    /// Steady state: applying watch events
    Watching,
    /// Watch stream ended without a close; last state is kept
    Inert,
    /// Closed by the caller
    Closed,
}

/// Builds resolvers for `grpclb:///<service>` targets on a shared store client.
pub struct Discoverer<S: CoordinationStore> {
    store: S,
    config: DiscoveryConfig,
}

impl Discoverer<EtcdStore> {
    /// Connect to etcd. An unreachable store is reported as `Error::Connect`.
    pub async fn connect(store_config: &StoreConfig, config: DiscoveryConfig) -> Result<Self> {
        let store = EtcdStore::connect(store_config).await?;
        Ok(Self::new(store, config))
    }
}

impl<S: CoordinationStore> Discoverer<S> {
    pub fn new(store: S, config: DiscoveryConfig) -> Self {
        Self { store, config }
    }

    pub fn scheme(&self) -> &'static str {
        SCHEMA
    }

    /// Snapshot the target's prefix, publish it, and start watching.
    ///
    /// Only the snapshot can fail the build; anything after it is confined to
    /// the background task.
    pub async fn build(&self, target: &Target, consumer: Arc<dyn Consumer>) -> Result<Resolver> {
        let prefix = target.prefix();
        let (phase, _) = watch::channel(ResolverPhase::Init);
        let phase = Arc::new(phase);

        let snapshot = read_snapshot(&self.store, &prefix, self.config.snapshot_timeout).await?;

        let mut addresses = AddressSet::new();
        addresses.reset(snapshot_entries(&prefix, &snapshot));
        phase.send_replace(ResolverPhase::SnapshotLoaded);
        info!(
            target = %target,
            addresses = addresses.len(),
            revision = snapshot.revision,
            "Discovery: snapshot loaded"
        );

        let shutdown = CancellationToken::new();
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        let task = WatchTask {
            store: self.store.clone(),
            target: target.clone(),
            prefix,
            consumer,
            addresses,
            snapshot_revision: snapshot.revision,
            revision: snapshot.revision,
            config: self.config.clone(),
            phase: phase.clone(),
            shutdown: shutdown.clone(),
            refresh_rx,
        };
        task.publish().await;

        let handle = tokio::spawn(task.run());

        Ok(Resolver {
            target: target.clone(),
            phase,
            refresh_tx,
            shutdown,
            task: Some(handle),
        })
    }
}

/// Handle for one live resolution of a target.
pub struct Resolver {
    target: Target,
    phase: Arc<watch::Sender<ResolverPhase>>,
    refresh_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Resolver {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn phase(&self) -> ResolverPhase {
        *self.phase.borrow()
    }

    /// Wait until the resolver reaches `phase`.
    pub async fn wait_for_phase(&self, phase: ResolverPhase) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|current| *current == phase).await;
    }

    /// Hint that the published state may be stale.
    ///
    /// Asks the watch task to re-read the prefix and publish the store's
    /// current truth. Never fails; requests coalesce while one is pending.
    pub fn resolve_now(&self) {
        match self.refresh_tx.try_send(()) {
            Ok(()) => debug!(target = %self.target, "ResolveNow: refresh requested"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(target = %self.target, "ResolveNow: refresh already pending")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target = %self.target, "ResolveNow: resolver is closed")
            }
        }
    }

    /// Stop watching. No publish happens after this returns.
    ///
    /// The store client belongs to the `Discoverer` and is shared by every
    /// resolver it built, so it stays connected; it is released when the
    /// `Discoverer` and its resolvers are dropped.
    pub async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        self.shutdown.cancel();
        if let Err(e) = task.await {
            warn!(target = %self.target, error = %e, "Watch task did not exit cleanly");
        }

        self.phase.send_replace(ResolverPhase::Closed);
        events::resolver_closed(self.target.service_name());
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_snapshot<S: CoordinationStore>(
    store: &S,
    prefix: &str,
    timeout: Duration,
) -> Result<Snapshot> {
    match tokio::time::timeout(timeout, store.get_prefix(prefix)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

fn snapshot_entries(prefix: &str, snapshot: &Snapshot) -> Vec<(String, AddressEntry)> {
    snapshot
        .kvs
        .iter()
        .filter_map(|kv| {
            AddressEntry::from_registry(prefix, &kv.key, &kv.value)
                .map(|entry| (kv.key.clone(), entry))
        })
        .collect()
}

/// Why a watch subscription stopped.
enum WatchEnd {
    Shutdown,
    Failed(String),
}

/// Background task owning the address set of one resolver.
struct WatchTask<S: CoordinationStore> {
    store: S,
    target: Target,
    prefix: String,
    consumer: Arc<dyn Consumer>,
    addresses: AddressSet,
    /// Revision of the last prefix read; events at or below it are already in `addresses`
    snapshot_revision: i64,
    /// Highest revision reflected in `addresses`; a re-watch starts after it
    revision: i64,
    config: DiscoveryConfig,
    phase: Arc<watch::Sender<ResolverPhase>>,
    shutdown: CancellationToken,
    refresh_rx: mpsc::Receiver<()>,
}

impl<S: CoordinationStore> WatchTask<S> {
    async fn run(mut self) {
        loop {
            let end = match self.store.watch_prefix(&self.prefix, self.revision + 1).await {
                Ok(subscription) => {
                    self.phase.send_replace(ResolverPhase::Watching);
                    info!(prefix = %self.prefix, from_revision = self.revision + 1, "Discovery: watching prefix");
                    self.watch(subscription).await
                }
                Err(e) => WatchEnd::Failed(e.to_string()),
            };

            let reason = match end {
                WatchEnd::Shutdown => return,
                WatchEnd::Failed(reason) => reason,
            };
            self.phase.send_replace(ResolverPhase::Inert);
            warn!(
                prefix = %self.prefix,
                reason = %reason,
                rewatch_delay = ?self.config.rewatch_delay,
                "Watch ended, resolver keeps its last state"
            );

            // Inert until a timed re-watch or a resolve_now request
            loop {
                let delay = self.config.rewatch_delay;
                let rewatch = async move {
                    match delay {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;

                    _ = self.shutdown.cancelled() => return,
                    request = self.refresh_rx.recv() => {
                        if request.is_none() {
                            return;
                        }
                    }
                    _ = rewatch => {}
                }

                match self.resnapshot().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(prefix = %self.prefix, error = %e, "Re-snapshot before re-watch failed")
                    }
                }
            }
        }
    }

    async fn watch(&mut self, mut subscription: Box<dyn WatchSubscription>) -> WatchEnd {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    subscription.cancel().await;
                    debug!(prefix = %self.prefix, "Watch canceled");
                    return WatchEnd::Shutdown;
                }

                Some(()) = self.refresh_rx.recv() => {
                    if let Err(e) = self.resnapshot().await {
                        warn!(prefix = %self.prefix, error = %e, "ResolveNow: re-snapshot failed");
                    }
                }

                batch = subscription.next_batch() => {
                    match batch {
                        Ok(Some(events)) => self.apply_batch(events).await,
                        Ok(None) => return WatchEnd::Failed("watch stream closed".to_string()),
                        Err(e) => return WatchEnd::Failed(e.to_string()),
                    }
                }
            }
        }
    }

    /// Replace the address set with a fresh prefix read and publish it.
    async fn resnapshot(&mut self) -> Result<()> {
        let snapshot = read_snapshot(&self.store, &self.prefix, self.config.snapshot_timeout).await?;

        self.addresses.reset(snapshot_entries(&self.prefix, &snapshot));
        self.snapshot_revision = snapshot.revision;
        self.revision = self.revision.max(snapshot.revision);
        debug!(
            prefix = %self.prefix,
            addresses = self.addresses.len(),
            revision = snapshot.revision,
            "Re-snapshot applied"
        );

        self.publish().await;
        Ok(())
    }

    /// Apply events in order, publishing after each.
    ///
    /// Events of one transaction share a revision, so only the snapshot
    /// revision is a skip floor, never the previous event's revision.
    async fn apply_batch(&mut self, batch: Vec<WatchEvent>) {
        for event in batch {
            if event.revision() <= self.snapshot_revision {
                trace!(key = %event.key(), revision = event.revision(), "Skipping event covered by snapshot");
                continue;
            }
            self.revision = self.revision.max(event.revision());
            metrics::record_watch_event(event.kind());

            self.apply(event);
            self.publish().await;
        }
    }

    fn apply(&mut self, event: WatchEvent) {
        let service = self.target.service_name();
        match event {
            WatchEvent::Put { key, value, .. } => {
                match AddressEntry::from_registry(&self.prefix, &key, &value) {
                    Some(entry) => {
                        events::address_upserted(service, &entry.addr, entry.weight());
                        self.addresses.upsert(key, entry);
                    }
                    None => debug!(key = %key, "Ignoring key without an instance address"),
                }
            }
            WatchEvent::Delete { key, .. } => {
                if let Some(entry) = self.addresses.remove(&key) {
                    events::address_removed(service, &entry.addr);
                }
            }
        }
    }

    async fn publish(&self) {
        let state = self.addresses.published();
        metrics::record_publish(self.target.service_name(), state.len());
        trace!(target = %self.target, addresses = state.len(), "Publishing address set");
        self.consumer.update_state(state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use grpclb_core::{MemoryStore, PublishedState};

    type Pairs = Vec<(String, u64)>;

    struct RecordingConsumer {
        tx: mpsc::UnboundedSender<Pairs>,
    }

    #[async_trait]
    impl Consumer for RecordingConsumer {
        async fn update_state(&self, state: PublishedState) {
            let _ = self.tx.send(state.weighted_addresses());
        }
    }

    fn recording() -> (Arc<RecordingConsumer>, mpsc::UnboundedReceiver<Pairs>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingConsumer { tx }), rx)
    }

    fn pairs(expected: &[(&str, u64)]) -> Pairs {
        expected
            .iter()
            .map(|(addr, weight)| (addr.to_string(), *weight))
            .collect()
    }

    async fn next_state(rx: &mut mpsc::UnboundedReceiver<Pairs>) -> Pairs {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for a published state")
            .expect("consumer channel closed")
    }

    async fn put(store: &MemoryStore, addr: &str, weight: &str) {
        store
            .put(&format!("/grpclb/echo/{addr}"), weight, None)
            .await
            .unwrap();
    }

    fn echo() -> Target {
        Target::new("echo").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_publishes_snapshot() {
        let store = MemoryStore::new();
        put(&store, "a:1", "1").await;
        put(&store, "b:2", "2").await;
        store.put("/grpclb/other/c:3", "3", None).await.unwrap();

        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (consumer, mut rx) = recording();
        let mut resolver = discoverer.build(&echo(), consumer).await.unwrap();

        assert_eq!(next_state(&mut rx).await, pairs(&[("a:1", 1), ("b:2", 2)]));
        resolver.wait_for_phase(ResolverPhase::Watching).await;
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_applies_put_and_delete() {
        let store = MemoryStore::new();
        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (consumer, mut rx) = recording();
        let mut resolver = discoverer.build(&echo(), consumer).await.unwrap();
        assert!(next_state(&mut rx).await.is_empty());

        put(&store, "a:1", "5").await;
        assert_eq!(next_state(&mut rx).await, pairs(&[("a:1", 5)]));

        put(&store, "a:1", "7").await;
        assert_eq!(next_state(&mut rx).await, pairs(&[("a:1", 7)]));

        store.delete("/grpclb/echo/a:1").await;
        assert!(next_state(&mut rx).await.is_empty());

        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_weight_defaults_to_one() {
        let store = MemoryStore::new();
        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (consumer, mut rx) = recording();
        let mut resolver = discoverer.build(&echo(), consumer).await.unwrap();
        next_state(&mut rx).await;

        put(&store, "d:4", "abc").await;
        assert_eq!(next_state(&mut rx).await, pairs(&[("d:4", 1)]));

        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_between_snapshot_and_watch_are_not_lost() {
        let store = MemoryStore::new();
        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (consumer, mut rx) = recording();

        let mut resolver = discoverer.build(&echo(), consumer).await.unwrap();
        // The watch task has not subscribed yet
        put(&store, "a:1", "2").await;

        assert!(next_state(&mut rx).await.is_empty());
        assert_eq!(next_state(&mut rx).await, pairs(&[("a:1", 2)]));
        resolver.close().await;
    }

    #[tokio::test]
    async fn test_build_fails_when_store_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true).await;
        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (consumer, mut rx) = recording();

        let result = discoverer.build(&echo(), consumer).await;

        assert!(matches!(result, Err(Error::Unavailable)));
        assert!(rx.try_recv().is_err());
        store.set_unavailable(false).await;
        assert_eq!(store.watcher_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_now_republishes_store_truth() {
        let store = MemoryStore::new();
        put(&store, "a:1", "1").await;
        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (consumer, mut rx) = recording();
        let mut resolver = discoverer.build(&echo(), consumer).await.unwrap();
        next_state(&mut rx).await;
        resolver.wait_for_phase(ResolverPhase::Watching).await;

        resolver.resolve_now();
        assert_eq!(next_state(&mut rx).await, pairs(&[("a:1", 1)]));

        resolver.close().await;
        // Never fails, even once closed
        resolver.resolve_now();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_publish_after_close() {
        let store = MemoryStore::new();
        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (consumer, mut rx) = recording();
        let mut resolver = discoverer.build(&echo(), consumer).await.unwrap();
        next_state(&mut rx).await;
        resolver.wait_for_phase(ResolverPhase::Watching).await;

        resolver.close().await;
        assert_eq!(resolver.phase(), ResolverPhase::Closed);
        assert_eq!(store.watcher_count().await, 0);

        put(&store, "a:1", "1").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        // Idempotent
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_watch_leaves_resolver_inert() {
        let store = MemoryStore::new();
        put(&store, "a:1", "1").await;
        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (consumer, mut rx) = recording();
        let mut resolver = discoverer.build(&echo(), consumer).await.unwrap();
        next_state(&mut rx).await;
        resolver.wait_for_phase(ResolverPhase::Watching).await;

        store.break_watches().await;
        resolver.wait_for_phase(ResolverPhase::Inert).await;

        put(&store, "b:2", "2").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        resolver.close().await;
        assert_eq!(resolver.phase(), ResolverPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewatch_recovers_after_broken_watch() {
        let store = MemoryStore::new();
        put(&store, "a:1", "1").await;
        let config = DiscoveryConfig::default().with_rewatch_delay(Duration::from_secs(2));
        let discoverer = Discoverer::new(store.clone(), config);
        let (consumer, mut rx) = recording();
        let mut resolver = discoverer.build(&echo(), consumer).await.unwrap();
        next_state(&mut rx).await;
        resolver.wait_for_phase(ResolverPhase::Watching).await;

        store.break_watches().await;
        resolver.wait_for_phase(ResolverPhase::Inert).await;
        store.delete("/grpclb/echo/a:1").await;

        // Re-snapshot after the delay reflects the missed delete
        assert!(next_state(&mut rx).await.is_empty());
        resolver.wait_for_phase(ResolverPhase::Watching).await;

        put(&store, "b:2", "2").await;
        assert_eq!(next_state(&mut rx).await, pairs(&[("b:2", 2)]));
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolvers_are_independent() {
        let store = MemoryStore::new();
        let discoverer = Discoverer::new(store.clone(), DiscoveryConfig::default());
        let (echo_consumer, mut echo_rx) = recording();
        let (pay_consumer, mut pay_rx) = recording();

        let mut echo_resolver = discoverer.build(&echo(), echo_consumer).await.unwrap();
        let mut pay_resolver = discoverer
            .build(&Target::new("payments").unwrap(), pay_consumer)
            .await
            .unwrap();
        next_state(&mut echo_rx).await;
        next_state(&mut pay_rx).await;

        store.put("/grpclb/payments/p:1", "4", None).await.unwrap();
        assert_eq!(next_state(&mut pay_rx).await, pairs(&[("p:1", 4)]));

        put(&store, "e:1", "2").await;
        assert_eq!(next_state(&mut echo_rx).await, pairs(&[("e:1", 2)]));

        // Closing one resolver leaves the shared store client usable
        echo_resolver.close().await;
        store.put("/grpclb/payments/p:2", "1", None).await.unwrap();
        assert_eq!(next_state(&mut pay_rx).await, pairs(&[("p:1", 4), ("p:2", 1)]));
        assert_eq!(store.watcher_count().await, 1);

        pay_resolver.close().await;
    }

    fn task_at(
        revision: i64,
        entries: &[(&str, &str)],
    ) -> (WatchTask<MemoryStore>, mpsc::UnboundedReceiver<Pairs>) {
        let (consumer, rx) = recording();
        let (phase, _) = watch::channel(ResolverPhase::Watching);
        let (_refresh_tx, refresh_rx) = mpsc::channel(1);
        let target = echo();
        let prefix = target.prefix();

        let mut addresses = AddressSet::new();
        addresses.reset(entries.iter().map(|(addr, weight)| {
            let key = format!("{prefix}{addr}");
            let entry = AddressEntry::from_registry(&prefix, &key, weight).unwrap();
            (key, entry)
        }));

        let task = WatchTask {
            store: MemoryStore::new(),
            prefix,
            target,
            consumer,
            addresses,
            snapshot_revision: revision,
            revision,
            config: DiscoveryConfig::default(),
            phase: Arc::new(phase),
            shutdown: CancellationToken::new(),
            refresh_rx,
        };
        (task, rx)
    }

    #[tokio::test]
    async fn test_events_covered_by_snapshot_are_skipped() {
        let (mut task, mut rx) = task_at(5, &[]);

        task.apply_batch(vec![
            WatchEvent::Put {
                key: "/grpclb/echo/old:1".into(),
                value: "1".into(),
                revision: 4,
            },
            WatchEvent::Put {
                key: "/grpclb/echo/new:1".into(),
                value: "3".into(),
                revision: 6,
            },
        ])
        .await;

        assert_eq!(rx.recv().await.unwrap(), pairs(&[("new:1", 3)]));
        assert!(rx.try_recv().is_err());
        assert_eq!(task.revision, 6);
    }

    #[tokio::test]
    async fn test_same_revision_deletes_are_all_applied() {
        let (mut task, mut rx) = task_at(5, &[("a:1", "1"), ("b:2", "2")]);

        task.apply_batch(vec![
            WatchEvent::Delete {
                key: "/grpclb/echo/a:1".into(),
                revision: 6,
            },
            WatchEvent::Delete {
                key: "/grpclb/echo/b:2".into(),
                revision: 6,
            },
        ])
        .await;

        assert_eq!(rx.recv().await.unwrap(), pairs(&[("b:2", 2)]));
        assert!(rx.recv().await.unwrap().is_empty());
        assert!(task.addresses.is_empty());
        assert_eq!(task.revision, 6);
    }
}
