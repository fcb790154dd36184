// src/core/cluster/model.rs

//! The cluster record and its validation rules.

use crate::core::errors::ManagerError;
use crate::core::store::{self, DocumentStore};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use uuid::Uuid;

pub const CLUSTER_TABLE: &str = "cluster";

/// Secret store blob names.
pub const SECRET_AUTH_TOKEN: &str = "auth_token";
pub const SECRET_TLS_CERT: &str = "tls_user_cert";
pub const SECRET_TLS_KEY: &str = "tls_user_key";

/// A registered cluster. The persisted row carries identity and discovery
/// state only; credentials travel on the struct during `put_cluster` and land
/// in the secret store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    /// Seed endpoint, resolved to the full topology via discovery.
    pub host: String,
    /// Last observed live endpoints, refreshed on every successful client build.
    #[serde(default)]
    pub known_hosts: Vec<String>,

    #[serde(skip)]
    pub auth_token: Option<String>,
    #[serde(skip)]
    pub tls_user_cert: Option<Vec<u8>>,
    #[serde(skip)]
    pub tls_user_key: Option<Vec<u8>>,
}

impl Cluster {
    /// The display label: name when set, id otherwise.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }

    /// Checks field-level invariants. Connectivity is checked separately.
    pub fn validate(&self) -> Result<(), ManagerError> {
        let mut errs = Vec::new();

        if self.host.is_empty() {
            errs.push("missing host".to_string());
        }
        // Names double as lookup keys next to ids, so an id-shaped name is ambiguous.
        if !self.name.is_empty() && Uuid::parse_str(&self.name).is_ok() {
            errs.push("name cannot be an UUID".to_string());
        }
        if let Some(token) = &self.auth_token {
            if token.is_empty() {
                errs.push("auth token cannot be empty".to_string());
            }
        }
        match (&self.tls_user_cert, &self.tls_user_key) {
            (Some(_), None) => errs.push("missing TLS user key".to_string()),
            (None, Some(_)) => errs.push("missing TLS user cert".to_string()),
            (Some(cert), Some(key)) => {
                if let Err(e) = validate_key_pair(cert, key) {
                    errs.push(format!("invalid TLS user key pair: {e}"));
                }
            }
            (None, None) => {}
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Validation(format!(
                "invalid cluster: {}",
                errs.join("; ")
            )))
        }
    }
}

fn validate_key_pair(cert_pem: &[u8], key_pem: &[u8]) -> Result<(), String> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut Cursor::new(cert_pem))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("cert: {e}"))?;
    if certs.is_empty() {
        return Err("cert: no certificate found".to_string());
    }
    match rustls_pemfile::private_key(&mut Cursor::new(key_pem)) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err("key: no private key found".to_string()),
        Err(e) => Err(format!("key: {e}")),
    }
}

/// Loads a cluster row by id.
pub async fn get_cluster(
    store: &dyn DocumentStore,
    id: Uuid,
) -> Result<Option<Cluster>, ManagerError> {
    store::get_doc(store, CLUSTER_TABLE, &id.to_string()).await
}

/// Type of a cluster change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// A cluster modification event delivered to listeners.
#[derive(Debug, Clone, Copy)]
pub struct Change {
    pub id: Uuid,
    pub change_type: ChangeType,
}
