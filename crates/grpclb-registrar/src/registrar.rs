//! Service Registrar
//!
//! Registration follows the store's write path:
//! 1. Grant a lease with the configured TTL
//! 2. Put `/grpclb/<service>/<address>` = weight, bound to the lease
//! 3. Start keep-alives and hand the stream to a background task
//!
//! Lease expiry is the only failure detector. When the keep-alive stream ends
//! the key is already gone (or about to be) and the registrar does not
//! re-register; callers can observe this through `is_alive` and `lease_lost`.

use crate::config::RegistrarConfig;
use grpclb_core::observability::{events, metrics};
use grpclb_core::{
    registry_key, CoordinationStore, EtcdStore, KeepAliveStream, LeaseId, Result, StoreConfig,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Handle for one registered instance.
pub struct Registrar<S: CoordinationStore> {
    /// Store client; `None` once closed
    store: Option<S>,
    key: String,
    weight: u64,
    lease_id: LeaseId,
    /// Stops the keep-alive task
    shutdown: CancellationToken,
    /// Cancelled by the keep-alive task when the lease is lost
    lease_lost: CancellationToken,
    keepalive_task: Option<JoinHandle<()>>,
}

impl Registrar<EtcdStore> {
    /// Connect to etcd and register the instance.
    ///
    /// An unreachable store is reported as `Error::Connect`.
    pub async fn connect(store_config: &StoreConfig, config: RegistrarConfig) -> Result<Self> {
        config.validate()?;
        let store = EtcdStore::connect(store_config).await?;
        Self::open(store, config).await
    }
}

impl<S: CoordinationStore> Registrar<S> {
    /// Register the instance on an already connected store.
    pub async fn open(store: S, config: RegistrarConfig) -> Result<Self> {
        config.validate()?;

        let key = registry_key(&config.service_name, &config.address);
        let lease_id = store.grant_lease(config.lease_ttl).await?;
        metrics::record_lease_granted();
        debug!(lease_id = lease_id, ttl = config.lease_ttl, "Lease granted");

        let keepalive = match Self::bind(
            &store,
            &key,
            config.weight,
            lease_id,
            config.keepalive_interval(),
        )
        .await
        {
            Ok(keepalive) => keepalive,
            Err(e) => {
                // Do not leave an orphaned lease behind a failed registration.
                if let Err(revoke_err) = store.revoke(lease_id).await {
                    warn!(lease_id = lease_id, error = %revoke_err, "Failed to revoke lease after registration error");
                }
                return Err(e);
            }
        };

        events::instance_registered(&key, config.weight, lease_id, config.lease_ttl);

        let shutdown = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let keepalive_task = spawn_keepalive_task(
            keepalive,
            key.clone(),
            lease_id,
            shutdown.clone(),
            lease_lost.clone(),
        );

        Ok(Self {
            store: Some(store),
            key,
            weight: config.weight,
            lease_id,
            shutdown,
            lease_lost,
            keepalive_task: Some(keepalive_task),
        })
    }

    async fn bind(
        store: &S,
        key: &str,
        weight: u64,
        lease_id: LeaseId,
        interval: Duration,
    ) -> Result<Box<dyn KeepAliveStream>> {
        store.put(key, &weight.to_string(), Some(lease_id)).await?;
        store.keep_alive(lease_id, interval).await
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Whether the registration is still backed by a live lease.
    pub fn is_alive(&self) -> bool {
        self.store.is_some() && !self.lease_lost.is_cancelled()
    }

    /// Resolves once the keep-alive stream has ended without a close.
    pub async fn lease_lost(&self) {
        self.lease_lost.cancelled().await
    }

    /// Stop keep-alives, revoke the lease and disconnect.
    ///
    /// The store deletes the key as part of the revoke. A revoke failure (for
    /// instance `Error::LeaseNotFound` after the lease expired) is returned,
    /// but the registrar is closed either way and later calls return `Ok(())`.
    pub async fn close(&mut self) -> Result<()> {
        let Some(store) = self.store.take() else {
            debug!(key = %self.key, "Registrar already closed");
            return Ok(());
        };

        self.shutdown.cancel();
        if let Some(task) = self.keepalive_task.take() {
            if let Err(e) = task.await {
                warn!(key = %self.key, error = %e, "Keep-alive task did not exit cleanly");
            }
        }

        let result = store.revoke(self.lease_id).await;
        match &result {
            Ok(()) => events::lease_revoked(&self.key, self.lease_id),
            Err(e) => warn!(
                key = %self.key,
                lease_id = self.lease_id,
                error = %e,
                "Failed to revoke lease"
            ),
        }

        drop(store);
        info!(key = %self.key, "Registrar closed");
        result
    }
}

impl<S: CoordinationStore> Drop for Registrar<S> {
    fn drop(&mut self) {
        // Without a close the key lingers until the lease TTL lapses.
        self.shutdown.cancel();
    }
}

/// Spawn the task consuming keep-alive acknowledgements until the stream ends
/// or `shutdown` fires.
fn spawn_keepalive_task(
    mut stream: Box<dyn KeepAliveStream>,
    key: String,
    lease_id: LeaseId,
    shutdown: CancellationToken,
    lease_lost: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!(lease_id = lease_id, "Keep-alive task stopped");
                    return;
                }

                result = stream.next_ack() => {
                    match result {
                        Ok(Some(ack)) => {
                            trace!(lease_id = lease_id, ttl = ack.ttl, "Keep-alive OK");
                            metrics::record_keepalive_ack();
                        }
                        Ok(None) => break "keep-alive stream closed".to_string(),
                        Err(e) => break e.to_string(),
                    }
                }
            }
        };

        metrics::record_lease_lost();
        events::lease_lost(&key, lease_id, &reason);
        lease_lost.cancel();
    })
}
