// src/core/client/model.rs

//! Wire models shared by the node-agent RPC surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

/// Datacenter name to member host addresses.
pub type Datacenters = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable node identity, distinct from any of its addresses.
    pub host_id: String,
    pub rpc_addr: String,
    pub broadcast_rpc_addr: String,
    pub listen_addr: String,
    pub cql_port: u16,
    pub shard_count: u32,
    pub agent_version: String,
}

/// Result of an asynchronous node-side command, e.g. a repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum CommandStatus {
    #[serde(rename = "RUNNING")]
    #[strum(serialize = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESSFUL")]
    #[strum(serialize = "SUCCESSFUL")]
    Successful,
    #[serde(rename = "FAILED")]
    #[strum(serialize = "FAILED")]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationStrategy {
    #[serde(rename = "LocalStrategy")]
    Local,
    #[serde(rename = "SimpleStrategy")]
    Simple,
    #[serde(rename = "NetworkTopologyStrategy")]
    NetworkTopology,
}

/// Replicas of a half-open token range `[start_token, end_token)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub start_token: i64,
    pub end_token: i64,
    pub replicas: Vec<String>,
}

/// Token ring of a keyspace, snapshotted at plan time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ring {
    pub tokens: Vec<TokenRange>,
    /// Host address to datacenter name.
    pub host_dc: HashMap<String, String>,
    pub replication: ReplicationStrategy,
}

impl Ring {
    /// Flattened `[start, end, start, end, ...]` list of the token ranges the
    /// given host is a replica of.
    pub fn host_token_ranges(&self, host: &str) -> Vec<i64> {
        let mut tr = Vec::new();
        for t in &self.tokens {
            if t.replicas.iter().any(|r| r == host) {
                tr.push(t.start_token);
                tr.push(t.end_token);
            }
        }
        tr
    }
}

// --- Remote filesystem models ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDirItem {
    pub name: String,
    pub path: String,
    pub size: i64,
    #[serde(default)]
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ListDirOpts {
    pub files_only: bool,
    pub dirs_only: bool,
    pub recurse: bool,
    pub no_mod_time: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatus {
    pub finished: bool,
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

/// A finished transfer or check entry reported by the agent for one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileTransfer {
    pub name: String,
    pub size: i64,
    pub bytes: i64,
    /// True when the agent only verified the file was already at the
    /// destination with a matching size.
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub completed_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferringFile {
    pub name: String,
    pub bytes: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStats {
    #[serde(default)]
    pub transferring: Vec<TransferringFile>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DiskUsage {
    pub free: i64,
    pub total: i64,
}

/// Stats group name the agent files a job's transfer records under.
pub fn job_group(job_id: i64) -> String {
    format!("job/{job_id}")
}

/// Groups transfer entries by file name preserving report order, so that a
/// check entry precedes its paired transfer entry.
pub fn file_transfers(transferred: Vec<FileTransfer>) -> HashMap<String, Vec<FileTransfer>> {
    let mut m: HashMap<String, Vec<FileTransfer>> = HashMap::new();
    for t in transferred {
        m.entry(t.name.clone()).or_default().push(t);
    }
    m
}
