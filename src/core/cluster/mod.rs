// src/core/cluster/mod.rs

//! The cluster registry: CRUD over cluster records with credential
//! validation, a put-time connectivity probe, and broadcast change
//! notification.

pub mod model;

use crate::core::client::{CachedProvider, ClientFactory, TlsIdentity};
use crate::core::errors::ManagerError;
use crate::core::ids;
use crate::core::parallel;
use crate::core::store::{self, DocumentStore, SecretStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use model::{Change, ChangeType, Cluster};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A subscriber to cluster changes. Listeners must be idempotent: a change
/// may be re-delivered when an earlier listener in the fan-out fails.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, change: &Change) -> Result<(), ManagerError>;
}

/// Manages cluster records.
pub struct Service {
    store: Arc<dyn DocumentStore>,
    secrets: Arc<dyn SecretStore>,
    provider: Arc<CachedProvider>,
    factory: Arc<dyn ClientFactory>,
    listeners: Mutex<Vec<Arc<dyn ChangeListener>>>,
}

impl Service {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        secrets: Arc<dyn SecretStore>,
        provider: Arc<CachedProvider>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            store,
            secrets,
            provider,
            factory,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes a listener to cluster changes.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners.lock().push(listener);
    }

    /// Blocking fan-out with first-error semantics.
    async fn notify(&self, change: Change) -> Result<(), ManagerError> {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for l in listeners {
            l.on_change(&change).await?;
        }
        Ok(())
    }

    /// Returns all clusters, ordered by id, optionally filtered by name.
    pub async fn list_clusters(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<Cluster>, ManagerError> {
        let rows = self.store.scan_prefix(model::CLUSTER_TABLE, "").await?;
        let mut clusters = Vec::with_capacity(rows.len());
        for (_, v) in rows {
            clusters.push(serde_json::from_value::<Cluster>(v)?);
        }
        if let Some(name) = name {
            clusters.retain(|c| c.name == name);
        }
        Ok(clusters)
    }

    pub async fn get_cluster(&self, id: Uuid) -> Result<Cluster, ManagerError> {
        model::get_cluster(self.store.as_ref(), id)
            .await?
            .ok_or(ManagerError::NotFound)
    }

    pub async fn get_cluster_by_name(&self, name: &str) -> Result<Cluster, ManagerError> {
        let matches = self.list_clusters(Some(name)).await?;
        match matches.len() {
            0 => Err(ManagerError::NotFound),
            1 => Ok(matches.into_iter().next().unwrap()),
            n => Err(ManagerError::InvalidState(format!(
                "{n} clusters share the name {name:?}"
            ))),
        }
    }

    /// Upserts a cluster. A nil id registers a new cluster. Credentials on
    /// the struct are stored in the secret store; a failed connectivity probe
    /// rolls back any secrets written by this call.
    pub async fn put_cluster(&self, c: &mut Cluster) -> Result<(), ManagerError> {
        let change_type = if c.id.is_nil() {
            c.id = ids::new_cluster_id();
            info!(cluster_id = %c.id, "Adding new cluster");
            ChangeType::Create
        } else {
            ChangeType::Update
        };

        c.validate()?;

        // Check for conflicting names among live clusters.
        if !c.name.is_empty() {
            match self.get_cluster_by_name(&c.name).await {
                Ok(conflict) if conflict.id != c.id => {
                    return Err(ManagerError::Validation(format!(
                        "name {:?} is already taken",
                        c.name
                    )));
                }
                Ok(_) | Err(ManagerError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let written = self.save_secrets(c).await?;

        if let Err(e) = self.validate_hosts_connectivity(c).await {
            self.rollback_secrets(c.id, &written).await;
            return Err(ManagerError::Validation(format!(
                "host connectivity check failed: {e}"
            )));
        }

        store::put_doc(
            self.store.as_ref(),
            model::CLUSTER_TABLE,
            &c.id.to_string(),
            c,
        )
        .await?;

        self.provider.invalidate(c.id).await;
        self.notify(Change {
            id: c.id,
            change_type,
        })
        .await
    }

    /// Removes a cluster, its secrets, and its cached client.
    pub async fn delete_cluster(&self, id: Uuid) -> Result<(), ManagerError> {
        debug!(cluster_id = %id, "DeleteCluster");
        if model::get_cluster(self.store.as_ref(), id).await?.is_none() {
            return Err(ManagerError::NotFound);
        }

        self.store
            .delete(model::CLUSTER_TABLE, &id.to_string())
            .await?;
        for name in [
            model::SECRET_AUTH_TOKEN,
            model::SECRET_TLS_CERT,
            model::SECRET_TLS_KEY,
        ] {
            self.secrets.delete(id, name).await?;
        }

        self.provider.invalidate(id).await;
        self.notify(Change {
            id,
            change_type: ChangeType::Delete,
        })
        .await
    }

    /// Writes the credentials carried on the struct and returns the names of
    /// the blobs this call changed, paired with their previous values.
    async fn save_secrets(
        &self,
        c: &Cluster,
    ) -> Result<Vec<(&'static str, Option<Vec<u8>>)>, ManagerError> {
        let mut written = Vec::new();

        let mut save = Vec::new();
        if let Some(token) = &c.auth_token {
            save.push((model::SECRET_AUTH_TOKEN, token.clone().into_bytes()));
        }
        if let Some(cert) = &c.tls_user_cert {
            save.push((model::SECRET_TLS_CERT, cert.clone()));
        }
        if let Some(key) = &c.tls_user_key {
            save.push((model::SECRET_TLS_KEY, key.clone()));
        }

        for (name, value) in save {
            let prev = self.secrets.get(c.id, name).await?;
            self.secrets.put(c.id, name, &value).await?;
            written.push((name, prev));
        }
        Ok(written)
    }

    async fn rollback_secrets(&self, id: Uuid, written: &[(&'static str, Option<Vec<u8>>)]) {
        for (name, prev) in written {
            let res = match prev {
                Some(value) => self.secrets.put(id, name, value).await,
                None => self.secrets.delete(id, name).await,
            };
            if let Err(e) = res {
                warn!(cluster_id = %id, secret = name, error = %e, "Secret rollback failed");
            }
        }
    }

    /// Resolves datacenters from the seed host and pings every host in every
    /// datacenter in parallel. A single failure rejects the upsert.
    async fn validate_hosts_connectivity(&self, c: &Cluster) -> Result<(), ManagerError> {
        let identity = match (&c.tls_user_cert, &c.tls_user_key) {
            (Some(cert), Some(key)) => Some(TlsIdentity {
                cert_pem: cert.clone(),
                key_pem: key.clone(),
            }),
            _ => None,
        };
        let token = match &c.auth_token {
            Some(t) => Some(t.clone()),
            None => self
                .secrets
                .get(c.id, model::SECRET_AUTH_TOKEN)
                .await?
                .map(|b| String::from_utf8_lossy(&b).into_owned()),
        };

        let client = self
            .factory
            .build(
                std::slice::from_ref(&c.host),
                token.as_deref(),
                identity.as_ref(),
            )
            .await?;

        let dcs = client.datacenters().await?;
        let hosts: Vec<(String, String)> = dcs
            .iter()
            .flat_map(|(dc, hs)| hs.iter().map(move |h| (dc.clone(), h.clone())))
            .collect();

        let failed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        parallel::run(hosts.len(), parallel::NO_LIMIT, |i| {
            let (dc, host) = hosts[i].clone();
            let client = client.clone();
            let failed = failed.clone();
            async move {
                if let Err(e) = client.ping(&host, PING_TIMEOUT).await {
                    debug!(dc = %dc, host = %host, error = %e, "Ping failed");
                    failed.lock().push(format!("{dc} {host}: {e}"));
                }
                Ok(())
            }
        })
        .await?;

        let failed = failed.lock();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Validation(format!(
                "failed to connect to nodes: {}",
                failed.join(", ")
            )))
        }
    }
}
