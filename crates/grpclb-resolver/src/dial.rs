//! Dialing a tonic channel through a resolver.
//!
//! tonic balances with power-of-two-choices over its endpoint set and has no
//! notion of endpoint weight. Weight is expressed by inserting each address
//! `min(weight, MAX_ENDPOINT_REPLICAS)` times, so heavier instances are
//! proportionally more likely to be picked.

use crate::consumer::Consumer;
use crate::discoverer::{Discoverer, Resolver};
use crate::target::Target;
use async_trait::async_trait;
use grpclb_core::{CoordinationStore, Error, PublishedState, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tonic::transport::channel::Change;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

/// Name of the weighted balancing policy.
pub const WEIGHT_POLICY: &str = "weight";

/// Upper bound on endpoint copies per address.
const MAX_ENDPOINT_REPLICAS: u32 = 32;

type EndpointKey = (String, u32);

/// Options for `Discoverer::dial`
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub load_balancing_policy: String,
    /// `None` dials plaintext `http://` endpoints
    pub tls: Option<ClientTlsConfig>,
    /// Capacity of the endpoint change channel
    pub buffer_size: usize,
    pub connect_timeout: Option<Duration>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            load_balancing_policy: WEIGHT_POLICY.to_string(),
            tls: None,
            buffer_size: 64,
            connect_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl DialOptions {
    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    fn endpoint(&self, addr: &str) -> Result<Endpoint> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
            .map_err(|e| Error::Transport(format!("invalid endpoint {addr}: {e}")))?;

        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| Error::Transport(e.to_string()))?;
        }
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        Ok(endpoint)
    }
}

/// A balanced tonic channel kept in sync with a resolver.
pub struct BalancedChannel {
    channel: Channel,
    resolver: Resolver,
    weights: Arc<RwLock<HashMap<String, u64>>>,
    policy: String,
}

impl BalancedChannel {
    /// Cheap to clone; hand it to generated clients.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn load_balancing_policy(&self) -> &str {
        &self.policy
    }

    /// Last published weight per address.
    pub async fn weights(&self) -> HashMap<String, u64> {
        self.weights.read().await.clone()
    }

    pub async fn close(&mut self) {
        self.resolver.close().await;
    }
}

impl<S: CoordinationStore> Discoverer<S> {
    /// Resolve `grpclb:///<service_name>` and dial a balanced channel over it.
    pub async fn dial(&self, service_name: &str, options: DialOptions) -> Result<BalancedChannel> {
        if options.load_balancing_policy != WEIGHT_POLICY {
            return Err(Error::InvalidConfig(format!(
                "unsupported load balancing policy `{}`, expected `{WEIGHT_POLICY}`",
                options.load_balancing_policy
            )));
        }

        let target = Target::new(service_name)?;
        let (channel, changes) = Channel::balance_channel::<EndpointKey>(options.buffer_size);
        let weights = Arc::new(RwLock::new(HashMap::new()));
        let policy = options.load_balancing_policy.clone();

        let consumer = Arc::new(ChannelConsumer {
            changes,
            options,
            weights: weights.clone(),
            inserted: Mutex::new(HashMap::new()),
        });
        let resolver = self.build(&target, consumer).await?;

        info!(target = %target, policy = %policy, "Dialed balanced channel");
        Ok(BalancedChannel {
            channel,
            resolver,
            weights,
            policy,
        })
    }

    /// Shorthand for `dial` with default options.
    pub async fn dial_default(&self, service_name: &str) -> Result<BalancedChannel> {
        self.dial(service_name, DialOptions::default()).await
    }
}

/// Translates published address sets into endpoint changes.
struct ChannelConsumer {
    changes: mpsc::Sender<Change<EndpointKey, Endpoint>>,
    options: DialOptions,
    weights: Arc<RwLock<HashMap<String, u64>>>,
    /// Replica count currently inserted per address
    inserted: Mutex<HashMap<String, u32>>,
}

impl ChannelConsumer {
    async fn send(&self, change: Change<EndpointKey, Endpoint>) {
        if self.changes.send(change).await.is_err() {
            debug!("Balanced channel dropped, ignoring endpoint change");
        }
    }
}

#[async_trait]
impl Consumer for ChannelConsumer {
    async fn update_state(&self, state: PublishedState) {
        let next: HashMap<String, u64> = state.weighted_addresses().into_iter().collect();
        let mut inserted = self.inserted.lock().await;

        let removed: Vec<(String, u32)> = inserted
            .iter()
            .filter(|(addr, _)| !next.contains_key(*addr))
            .map(|(addr, replicas)| (addr.clone(), *replicas))
            .collect();
        for (addr, replicas) in removed {
            for replica in 0..replicas {
                self.send(Change::Remove((addr.clone(), replica))).await;
            }
            inserted.remove(&addr);
        }

        for (addr, weight) in &next {
            let wanted = (*weight).clamp(1, u64::from(MAX_ENDPOINT_REPLICAS)) as u32;
            let have = inserted.get(addr).copied().unwrap_or(0);
            if wanted == have {
                continue;
            }

            if wanted < have {
                for replica in wanted..have {
                    self.send(Change::Remove((addr.clone(), replica))).await;
                }
            } else {
                let endpoint = match self.options.endpoint(addr) {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        warn!(address = %addr, error = %e, "Skipping address");
                        continue;
                    }
                };
                for replica in have..wanted {
                    self.send(Change::Insert((addr.clone(), replica), endpoint.clone()))
                        .await;
                }
            }
            inserted.insert(addr.clone(), wanted);
        }

        *self.weights.write().await = next;
    }
}
