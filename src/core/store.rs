// src/core/store.rs

//! Contracts for the external persistence collaborators: a keyed document
//! store with atomic per-row writes and ascending range scans by composite
//! key, and a byte-blob secret store keyed by cluster identity. The in-memory
//! implementations back the test suite and the default binary wiring.

use crate::core::errors::ManagerError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// A keyed document store. Keys are composite, `/`-joined strings; scans are
/// ascending in key order so time-ordered id components sort chronologically.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, table: &str, key: &str, doc: Value) -> Result<(), ManagerError>;
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, ManagerError>;
    async fn delete(&self, table: &str, key: &str) -> Result<(), ManagerError>;
    /// Returns all rows whose key starts with `prefix`, ascending by key.
    async fn scan_prefix(
        &self,
        table: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, ManagerError>;
}

/// A secret store holding named byte blobs per cluster.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put(&self, cluster_id: Uuid, name: &str, value: &[u8]) -> Result<(), ManagerError>;
    async fn get(&self, cluster_id: Uuid, name: &str) -> Result<Option<Vec<u8>>, ManagerError>;
    async fn delete(&self, cluster_id: Uuid, name: &str) -> Result<(), ManagerError>;
}

/// Serializes `doc` and writes it under `table`/`key`.
pub async fn put_doc<T: Serialize>(
    store: &dyn DocumentStore,
    table: &str,
    key: &str,
    doc: &T,
) -> Result<(), ManagerError> {
    store.put(table, key, serde_json::to_value(doc)?).await
}

/// Reads and deserializes the row under `table`/`key`, if present.
pub async fn get_doc<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    table: &str,
    key: &str,
) -> Result<Option<T>, ManagerError> {
    match store.get(table, key).await? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

/// In-memory `DocumentStore` over per-table ordered maps.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn put(&self, table: &str, key: &str, doc: Value) -> Result<(), ManagerError> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), doc);
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, ManagerError> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), ManagerError> {
        if let Some(t) = self.tables.write().get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn scan_prefix(
        &self,
        table: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, ManagerError> {
        let tables = self.tables.read();
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// In-memory `SecretStore`.
#[derive(Default)]
pub struct MemorySecretStore {
    blobs: RwLock<HashMap<(Uuid, String), Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn put(&self, cluster_id: Uuid, name: &str, value: &[u8]) -> Result<(), ManagerError> {
        self.blobs
            .write()
            .insert((cluster_id, name.to_string()), value.to_vec());
        Ok(())
    }

    async fn get(&self, cluster_id: Uuid, name: &str) -> Result<Option<Vec<u8>>, ManagerError> {
        Ok(self
            .blobs
            .read()
            .get(&(cluster_id, name.to_string()))
            .cloned())
    }

    async fn delete(&self, cluster_id: Uuid, name: &str) -> Result<(), ManagerError> {
        self.blobs.write().remove(&(cluster_id, name.to_string()));
        Ok(())
    }
}
