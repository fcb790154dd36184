// src/core/client/mod.rs

//! RPC access to database nodes and their on-host agents. `NodeApi` is the
//! narrow seam the orchestrators consume; `HttpClient` implements it over the
//! agents' HTTP API, and `CachedProvider` hands out one pinned client per
//! registered cluster.

pub mod config;
pub mod http;
pub mod model;
pub mod pool;
pub mod provider;

use crate::core::errors::ManagerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub use config::{ClientConfig, Scheme};
pub use http::HttpClient;
pub use model::{
    CommandStatus, Datacenters, DiskUsage, FileTransfer, JobStatus, ListDirItem, ListDirOpts,
    NodeInfo, ReplicationStrategy, Ring, TokenRange, TransferStats, TransferringFile,
};
pub use provider::{
    CachedProvider, ClientFactory, ClientProvider, HttpClientFactory, TlsIdentity,
};

/// The RPC surface the orchestrators consume. Cluster-scoped calls may be
/// served by any live node; host-scoped calls target the given node's agent.
#[async_trait]
pub trait NodeApi: Send + Sync {
    // --- Cluster-scoped ---

    async fn datacenters(&self) -> Result<Datacenters, ManagerError>;
    async fn keyspaces(&self) -> Result<Vec<String>, ManagerError>;
    async fn tables(&self, keyspace: &str) -> Result<Vec<String>, ManagerError>;
    async fn describe_ring(&self, keyspace: &str) -> Result<Ring, ManagerError>;

    // --- Host-scoped ---

    async fn ping(&self, host: &str, timeout: Duration) -> Result<Duration, ManagerError>;
    async fn node_info(&self, host: &str) -> Result<NodeInfo, ManagerError>;

    async fn take_snapshot(
        &self,
        host: &str,
        tag: &str,
        keyspace: &str,
        tables: &[String],
    ) -> Result<(), ManagerError>;
    async fn snapshots(&self, host: &str) -> Result<Vec<String>, ManagerError>;
    async fn delete_snapshot(&self, host: &str, tag: &str) -> Result<(), ManagerError>;

    /// Starts an asynchronous repair of `ranges` (pairs of start/end tokens)
    /// on `host` and returns the node-side command id.
    async fn repair(
        &self,
        host: &str,
        keyspace: &str,
        ranges: &[(i64, i64)],
        dcs: &[String],
        hosts: Option<&[String]>,
    ) -> Result<i64, ManagerError>;
    async fn repair_status(&self, host: &str, command_id: i64)
    -> Result<CommandStatus, ManagerError>;
    async fn kill_all_repairs(&self, host: &str) -> Result<(), ManagerError>;

    // --- Remote filesystem subset ---

    async fn list_dir(
        &self,
        host: &str,
        path: &str,
        opts: ListDirOpts,
    ) -> Result<Vec<ListDirItem>, ManagerError>;
    async fn cat(&self, host: &str, remote_path: &str) -> Result<Vec<u8>, ManagerError>;
    async fn put(&self, host: &str, remote_path: &str, body: Bytes) -> Result<(), ManagerError>;
    /// Asynchronously copies a local directory to a remote location and
    /// returns the agent job id.
    async fn copy_dir(&self, host: &str, dst: &str, src: &str) -> Result<i64, ManagerError>;
    /// `wait` enables agent-side long polling when non-zero.
    async fn job_status(
        &self,
        host: &str,
        job_id: i64,
        wait: Duration,
    ) -> Result<JobStatus, ManagerError>;
    async fn job_stop(&self, host: &str, job_id: i64) -> Result<(), ManagerError>;
    async fn transferred(
        &self,
        host: &str,
        group: &str,
    ) -> Result<Vec<FileTransfer>, ManagerError>;
    async fn stats(&self, host: &str, group: &str) -> Result<TransferStats, ManagerError>;
    async fn stats_reset(&self, host: &str, group: &str) -> Result<(), ManagerError>;
    async fn delete_remote_file(&self, host: &str, remote_path: &str)
    -> Result<(), ManagerError>;
    async fn disk_usage(&self, host: &str, path: &str) -> Result<DiskUsage, ManagerError>;
    /// Sets the agent bandwidth cap in MiB/s; `0` removes the cap.
    async fn set_bandwidth_limit(&self, host: &str, limit: u32) -> Result<(), ManagerError>;
}
