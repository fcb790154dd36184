// src/core/client/provider.rs

//! Per-cluster cached client factory. On a cache miss the provider reads the
//! cluster record and its secrets straight from the stores (no registry
//! dependency), discovers datacenters from the seed hosts, picks the closest
//! datacenter by median round-trip time, and pins the client to its hosts.

use super::config::ClientConfig;
use super::http::HttpClient;
use super::model::Datacenters;
use super::NodeApi;
use crate::core::cluster::model;
use crate::core::errors::ManagerError;
use crate::core::store::{self, DocumentStore, SecretStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Client-auth key pair in PEM form.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Builds a `NodeApi` client over a set of hosts. The HTTP factory is the
/// production implementation; tests substitute fakes.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(
        &self,
        hosts: &[String],
        auth_token: Option<&str>,
        identity: Option<&TlsIdentity>,
    ) -> Result<Arc<dyn NodeApi>, ManagerError>;
}

pub struct HttpClientFactory {
    config: ClientConfig,
}

impl HttpClientFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn build(
        &self,
        hosts: &[String],
        auth_token: Option<&str>,
        identity: Option<&TlsIdentity>,
    ) -> Result<Arc<dyn NodeApi>, ManagerError> {
        let client = HttpClient::new(hosts.to_vec(), auth_token, identity, self.config.clone())?;
        Ok(Arc::new(client))
    }
}

/// Hands out a `NodeApi` client for a registered cluster.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client(&self, cluster_id: Uuid) -> Result<Arc<dyn NodeApi>, ManagerError>;
}

pub struct CachedProvider {
    store: Arc<dyn DocumentStore>,
    secrets: Arc<dyn SecretStore>,
    factory: Arc<dyn ClientFactory>,
    cache: Mutex<HashMap<Uuid, Arc<dyn NodeApi>>>,
}

impl CachedProvider {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        secrets: Arc<dyn SecretStore>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            store,
            secrets,
            factory,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drops the cached client so the next access rebuilds it.
    pub async fn invalidate(&self, cluster_id: Uuid) {
        self.cache.lock().await.remove(&cluster_id);
    }

    async fn build(&self, cluster_id: Uuid) -> Result<Arc<dyn NodeApi>, ManagerError> {
        let mut cluster = model::get_cluster(self.store.as_ref(), cluster_id)
            .await?
            .ok_or(ManagerError::NotFound)?;

        let token = self
            .secrets
            .get(cluster_id, model::SECRET_AUTH_TOKEN)
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        let identity = load_identity(self.secrets.as_ref(), cluster_id).await?;

        let seeds = if cluster.known_hosts.is_empty() {
            vec![cluster.host.clone()]
        } else {
            cluster.known_hosts.clone()
        };
        let seed_client = self
            .factory
            .build(&seeds, token.as_deref(), identity.as_ref())
            .await?;

        let dcs = seed_client.datacenters().await?;
        let closest = closest_dc(seed_client.as_ref(), &dcs).await?;
        info!(cluster_id = %cluster_id, dc = %closest, "New client");

        let pinned = self
            .factory
            .build(&dcs[&closest], token.as_deref(), identity.as_ref())
            .await?;

        // Refresh the known-hosts cache with everything discovery returned.
        let mut known: Vec<String> = dcs.values().flatten().cloned().collect();
        known.sort();
        if known != cluster.known_hosts {
            cluster.known_hosts = known;
            store::put_doc(
                self.store.as_ref(),
                model::CLUSTER_TABLE,
                &cluster.id.to_string(),
                &cluster,
            )
            .await?;
        }

        Ok(pinned)
    }
}

#[async_trait]
impl ClientProvider for CachedProvider {
    async fn client(&self, cluster_id: Uuid) -> Result<Arc<dyn NodeApi>, ManagerError> {
        let mut cache = self.cache.lock().await;
        if let Some(c) = cache.get(&cluster_id) {
            return Ok(c.clone());
        }
        debug!(cluster_id = %cluster_id, "Building client");
        let client = self.build(cluster_id).await?;
        cache.insert(cluster_id, client.clone());
        Ok(client)
    }
}

/// Loads the cluster's client-auth key pair from the secret store, if set.
pub async fn load_identity(
    secrets: &dyn SecretStore,
    cluster_id: Uuid,
) -> Result<Option<TlsIdentity>, ManagerError> {
    let cert = secrets.get(cluster_id, model::SECRET_TLS_CERT).await?;
    let key = secrets.get(cluster_id, model::SECRET_TLS_KEY).await?;
    match (cert, key) {
        (Some(cert_pem), Some(key_pem)) => Ok(Some(TlsIdentity { cert_pem, key_pem })),
        (None, None) => Ok(None),
        _ => Err(ManagerError::InvalidState(
            "cluster has half of a TLS key pair".into(),
        )),
    }
}

const DC_PING_SAMPLE: usize = 3;
const DC_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Picks the datacenter with the lowest median round-trip time over a small
/// sample of pings against each datacenter's hosts.
pub async fn closest_dc(client: &dyn NodeApi, dcs: &Datacenters) -> Result<String, ManagerError> {
    if dcs.is_empty() {
        return Err(ManagerError::Structural("no datacenters discovered".into()));
    }

    let mut best: Option<(String, Duration)> = None;
    // Iterate in name order so ties break deterministically.
    let mut names: Vec<&String> = dcs.keys().collect();
    names.sort();

    for dc in names {
        let hosts = &dcs[dc];
        let mut rtts = Vec::new();
        for host in hosts.iter().take(DC_PING_SAMPLE) {
            if let Ok(rtt) = client.ping(host, DC_PING_TIMEOUT).await {
                rtts.push(rtt);
            }
        }
        if rtts.is_empty() {
            continue;
        }
        rtts.sort();
        let median = rtts[rtts.len() / 2];
        debug!(dc = %dc, rtt = ?median, "Measured datacenter");
        if best.as_ref().map(|(_, b)| median < *b).unwrap_or(true) {
            best = Some((dc.clone(), median));
        }
    }

    best.map(|(dc, _)| dc)
        .ok_or_else(|| ManagerError::Transient("no reachable datacenter".into()))
}
