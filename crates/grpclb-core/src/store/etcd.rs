//! Etcd Store
//!
//! `CoordinationStore` backed by `etcd-client`. Connection is verified with a
//! status call and retried with exponential backoff, bounded by the dial
//! timeout.

use super::{
    CoordinationStore, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, Snapshot, WatchEvent,
    WatchSubscription,
};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, WatchOptions, WatchStream, Watcher,
};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Etcd-backed coordination store
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to etcd and verify the connection.
    ///
    /// Gives up with `Error::Connect` once `dial_timeout` has elapsed.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::InvalidConfig("no etcd endpoints configured".into()));
        }

        let backoff = ExponentialBackoff {
            initial_interval: config.backoff_initial,
            max_interval: config.backoff_max,
            max_elapsed_time: Some(config.dial_timeout),
            multiplier: config.backoff_multiplier,
            ..Default::default()
        };
        let endpoints = &config.endpoints;

        let attempt = retry(backoff, || async {
            let options = ConnectOptions::new()
                .with_connect_timeout(config.dial_timeout)
                .with_timeout(config.request_timeout);

            let mut client = Client::connect(endpoints, Some(options))
                .await
                .map_err(|e| {
                    warn!(error = %e, "etcd connection failed, retrying");
                    backoff::Error::transient(e)
                })?;

            let status = client.status().await.map_err(|e| {
                warn!(error = %e, "etcd status check failed, retrying");
                backoff::Error::transient(e)
            })?;
            debug!(version = %status.version(), "etcd connection verified");

            Ok::<Client, backoff::Error<etcd_client::Error>>(client)
        });

        match tokio::time::timeout(config.dial_timeout, attempt).await {
            Ok(Ok(client)) => Ok(Self { client }),
            Ok(Err(e)) => Err(Error::Connect {
                endpoints: config.endpoints.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Connect {
                endpoints: config.endpoints.clone(),
                reason: format!("timed out after {:?}", config.dial_timeout),
            }),
        }
    }

}

/// Map "requested lease not found" responses to a typed error.
fn lease_error(err: etcd_client::Error, lease: LeaseId) -> Error {
    if err.to_string().contains("lease not found") {
        Error::LeaseNotFound(lease)
    } else {
        Error::Store(err)
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        debug!(lease_id = resp.id(), ttl = resp.ttl(), "Lease granted");
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await.map_err(|e| match lease {
            Some(id) => lease_error(e, id),
            None => Error::Store(e),
        })?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: lossy(kv.key()),
                value: lossy(kv.value()),
            })
            .collect();

        Ok(Snapshot { kvs, revision })
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> Result<Box<dyn KeepAliveStream>> {
        let mut client = self.client.clone();
        let (keeper, stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| lease_error(e, lease))?;

        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // Skip first immediate tick

        Ok(Box::new(EtcdKeepAlive {
            lease_id: lease,
            keeper,
            stream,
            interval,
        }))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease)
            .await
            .map_err(|e| lease_error(e, lease))?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<Box<dyn WatchSubscription>> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }

        let stream = client.watch(prefix, Some(options)).await?;
        debug!(prefix = %prefix, start_revision, "Watch stream established");

        Ok(Box::new(EtcdWatch {
            stream: Some(stream),
        }))
    }
}

struct EtcdKeepAlive {
    lease_id: LeaseId,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
    interval: Interval,
}

#[async_trait]
impl KeepAliveStream for EtcdKeepAlive {
    async fn next_ack(&mut self) -> Result<Option<KeepAliveAck>> {
        self.interval.tick().await;
        self.keeper.keep_alive().await?;

        match self.stream.message().await? {
            Some(resp) if resp.ttl() > 0 => {
                trace!(lease_id = self.lease_id, ttl = resp.ttl(), "Keep-alive OK");
                Ok(Some(KeepAliveAck {
                    lease_id: resp.id(),
                    ttl: resp.ttl(),
                }))
            }
            Some(_) => {
                // TTL <= 0: the store already dropped the lease.
                warn!(lease_id = self.lease_id, "Lease expired at store");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

struct EtcdWatch {
    stream: Option<(Watcher, WatchStream)>,
}

#[async_trait]
impl WatchSubscription for EtcdWatch {
    async fn next_batch(&mut self) -> Result<Option<Vec<WatchEvent>>> {
        let Some((_, stream)) = self.stream.as_mut() else {
            return Ok(None);
        };

        let Some(resp) = stream.message().await? else {
            self.stream = None;
            return Ok(None);
        };

        if resp.canceled() {
            self.stream = None;
            return Err(Error::WatchCanceled("stream canceled by server".into()));
        }

        let mut events = Vec::with_capacity(resp.events().len());
        for event in resp.events() {
            let Some(kv) = event.kv() else {
                continue;
            };
            let key = lossy(kv.key());
            let revision = kv.mod_revision();

            events.push(match event.event_type() {
                EventType::Put => WatchEvent::Put {
                    key,
                    value: lossy(kv.value()),
                    revision,
                },
                EventType::Delete => WatchEvent::Delete { key, revision },
            });
        }

        Ok(Some(events))
    }

    async fn cancel(&mut self) {
        // Dropping the stream closes the request channel and the server side watcher.
        self.stream = None;
    }
}
