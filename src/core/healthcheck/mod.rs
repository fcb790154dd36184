// src/core/healthcheck/mod.rs

//! Per-node CQL liveness probing with round-trip measurement and an
//! opt-in TLS auto-upgrade for clusters that close plaintext connections.

pub mod cqlping;

use crate::core::client::ClientProvider;
use crate::core::cluster::model::{self, Change};
use crate::core::cluster::ChangeListener;
use crate::core::errors::ManagerError;
use crate::core::parallel;
use crate::core::store::SecretStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthcheckConfig {
    /// CQL port probed on every node.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(with = "humantime_serde", default = "default_ping_timeout")]
    pub ping_timeout: Duration,
    /// When set, an EOF during a plaintext handshake triggers one retry over
    /// TLS without certificate verification, and the outcome is cached.
    #[serde(default)]
    pub tls_auto_upgrade: bool,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ping_timeout: default_ping_timeout(),
            tls_auto_upgrade: false,
        }
    }
}

fn default_port() -> u16 {
    9042
}
fn default_ping_timeout() -> Duration {
    Duration::from_millis(250)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CqlStatus {
    #[serde(rename = "UP")]
    #[strum(serialize = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    #[strum(serialize = "DOWN")]
    Down,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HostStatus {
    pub dc: String,
    pub host: String,
    pub cql_status: CqlStatus,
    /// True when the probe speaks TLS to this cluster.
    pub ssl: bool,
    pub rtt_ms: f64,
}

type TlsEntry = Option<Arc<rustls::ClientConfig>>;

/// Probes cluster nodes over their CQL port.
pub struct Service {
    provider: Arc<dyn ClientProvider>,
    secrets: Arc<dyn SecretStore>,
    config: HealthcheckConfig,
    /// Per-cluster TLS configuration; `None` inside the entry means the
    /// cluster was probed and needs no TLS.
    tls_cache: Mutex<HashMap<Uuid, TlsEntry>>,
}

impl Service {
    pub fn new(
        provider: Arc<dyn ClientProvider>,
        secrets: Arc<dyn SecretStore>,
        config: HealthcheckConfig,
    ) -> Self {
        Self {
            provider,
            secrets,
            config,
            tls_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Probes every node of the cluster in parallel and returns their
    /// statuses ordered by datacenter and host.
    pub async fn status(&self, cluster_id: Uuid) -> Result<Vec<HostStatus>, ManagerError> {
        let client = self.provider.client(cluster_id).await?;
        let dcs = client.datacenters().await?;

        let hosts: Vec<(String, String)> = dcs
            .iter()
            .flat_map(|(dc, hs)| hs.iter().map(move |h| (dc.clone(), h.clone())))
            .collect();

        let statuses = Mutex::new(Vec::with_capacity(hosts.len()));
        parallel::run(hosts.len(), parallel::NO_LIMIT, |i| {
            let (dc, host) = hosts[i].clone();
            let statuses = &statuses;
            async move {
                let status = match self.ping(cluster_id, &host).await {
                    Ok(rtt) => HostStatus {
                        dc,
                        host,
                        cql_status: CqlStatus::Up,
                        ssl: self.has_tls_config(cluster_id),
                        rtt_ms: rtt.as_secs_f64() * 1000.0,
                    },
                    Err(e) => {
                        info!(cluster_id = %cluster_id, host = %host, error = %e, "Ping failed");
                        HostStatus {
                            dc,
                            host,
                            cql_status: CqlStatus::Down,
                            ssl: self.has_tls_config(cluster_id),
                            rtt_ms: 0.0,
                        }
                    }
                };
                statuses.lock().push(status);
                Ok(())
            }
        })
        .await?;

        let mut statuses = statuses.into_inner();
        statuses.sort_by(|a, b| (&a.dc, &a.host).cmp(&(&b.dc, &b.host)));
        Ok(statuses)
    }

    async fn ping(&self, cluster_id: Uuid, host: &str) -> Result<Duration, ManagerError> {
        let tls = self.tls_config(cluster_id).await?;
        let mut config = cqlping::PingConfig {
            addr: format!("{host}:{}", self.config.port),
            timeout: self.config.ping_timeout,
            tls,
        };

        let res = cqlping::ping(&config).await;

        // A server that requires TLS cuts the plaintext handshake short.
        if self.config.tls_auto_upgrade && config.tls.is_none() {
            if let Err(e) = &res {
                if e.is_unexpected_eof() {
                    info!(cluster_id = %cluster_id, host = %host, "Upgrading connection to TLS");
                    config.tls = Some(cqlping::insecure_config());
                    let rtt = cqlping::ping(&config).await?;
                    self.tls_cache.lock().insert(cluster_id, config.tls);
                    return Ok(rtt);
                }
            }
        }

        res
    }

    async fn tls_config(&self, cluster_id: Uuid) -> Result<TlsEntry, ManagerError> {
        if let Some(entry) = self.tls_cache.lock().get(&cluster_id) {
            return Ok(entry.clone());
        }

        debug!(cluster_id = %cluster_id, "Loading TLS key pair from secret store");
        let cert = self
            .secrets
            .get(cluster_id, model::SECRET_TLS_CERT)
            .await?;
        let key = self.secrets.get(cluster_id, model::SECRET_TLS_KEY).await?;

        let entry: TlsEntry = match (cert, key) {
            (Some(cert), Some(key)) => {
                Some(cqlping::insecure_config_with_identity(&cert, &key)?)
            }
            _ => None,
        };
        self.tls_cache.lock().insert(cluster_id, entry.clone());
        Ok(entry)
    }

    fn has_tls_config(&self, cluster_id: Uuid) -> bool {
        matches!(self.tls_cache.lock().get(&cluster_id), Some(Some(_)))
    }

    /// Frees the cluster's cached TLS configuration forcing a reload from the
    /// secret store on next use.
    pub fn invalidate_tls_cache(&self, cluster_id: Uuid) {
        self.tls_cache.lock().remove(&cluster_id);
    }
}

#[async_trait]
impl ChangeListener for Service {
    async fn on_change(&self, change: &Change) -> Result<(), ManagerError> {
        self.invalidate_tls_cache(change.id);
        Ok(())
    }
}
