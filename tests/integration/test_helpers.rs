// tests/integration/test_helpers.rs

//! Test helpers: an in-memory fake node agent implementing `NodeApi`, plus
//! wiring for services over in-memory stores.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use ringmaster::core::backup::{self, BackupConfig};
use ringmaster::core::client::{
    ClientFactory, ClientProvider, CommandStatus, Datacenters, DiskUsage, FileTransfer,
    JobStatus, ListDirItem, ListDirOpts, NodeApi, NodeInfo, ReplicationStrategy, Ring,
    TlsIdentity, TokenRange, TransferStats,
};
use ringmaster::core::repair::{self, RepairConfig};
use ringmaster::core::store::{MemorySecretStore, MemoryStore};
use ringmaster::core::ManagerError;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub fn host_id(host: &str) -> String {
    format!("hid-{host}")
}

#[derive(Debug, Clone)]
pub struct RepairCall {
    pub host: String,
    pub keyspace: String,
    pub ranges: usize,
}

#[derive(Debug, Clone)]
pub struct CopyDirCall {
    pub host: String,
    pub dst: String,
    pub src: String,
}

#[derive(Debug, Clone, Default)]
pub struct FakeJob {
    pub transfers: Vec<FileTransfer>,
    pub finished: bool,
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct TableFiles {
    /// `<table>-<32-hex-id>` directory name.
    pub dir: String,
    pub files: Vec<(String, i64)>,
}

#[derive(Default)]
pub struct FakeState {
    pub next_command: i64,
    pub commands: HashMap<i64, (Instant, CommandStatus)>,
    pub repair_calls: Vec<RepairCall>,
    pub busy_hosts: HashSet<String>,
    pub fail_repair_hosts: HashSet<String>,

    pub snapshots: HashMap<String, BTreeSet<String>>,
    /// `(host, keyspace)` to versioned table directories.
    pub local: HashMap<(String, String), Vec<TableFiles>>,

    /// Shared remote object store, keyed by full remote path.
    pub remote: BTreeMap<String, Vec<u8>>,
    pub fail_put_substrings: Vec<String>,

    pub next_job: i64,
    pub jobs: HashMap<i64, FakeJob>,
    pub copy_dir_calls: Vec<CopyDirCall>,
    pub bandwidth: HashMap<String, Vec<u32>>,

    pub fail_ping_hosts: HashSet<String>,
    pub ping_latency: HashMap<String, Duration>,
    pub disk_free_percent: HashMap<String, i64>,
}

pub struct FakeAgent {
    pub dcs: Datacenters,
    pub schema: Vec<(String, Vec<String>)>,
    pub shard_count: u32,
    pub rings: Mutex<HashMap<String, Ring>>,
    pub repair_delay: Mutex<Duration>,
    pub state: Mutex<FakeState>,
}

impl FakeAgent {
    pub fn new(dcs: &[(&str, &[&str])], schema: &[(&str, &[&str])], rf: usize) -> Arc<Self> {
        let datacenters: Datacenters = dcs
            .iter()
            .map(|(dc, hosts)| {
                (
                    dc.to_string(),
                    hosts.iter().map(|h| h.to_string()).collect(),
                )
            })
            .collect();
        let schema: Vec<(String, Vec<String>)> = schema
            .iter()
            .map(|(ks, tables)| {
                (
                    ks.to_string(),
                    tables.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect();

        let mut rings = HashMap::new();
        for (ks, _) in &schema {
            rings.insert(ks.clone(), build_ring(dcs, rf, None));
        }

        let agent = Self {
            dcs: datacenters,
            schema,
            shard_count: 2,
            rings: Mutex::new(rings),
            repair_delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(FakeState::default()),
        };
        agent.set_generation(1);
        Arc::new(agent)
    }

    /// Rebuilds every host's local table files for the given generation,
    /// simulating new sstables landing between backup runs.
    pub fn set_generation(&self, generation: u32) {
        let mut state = self.state.lock();
        state.local.clear();
        for hosts in self.dcs.values() {
            for host in hosts {
                for (ks_idx, (ks, tables)) in self.schema.iter().enumerate() {
                    let mut dirs = Vec::new();
                    for (t_idx, table) in tables.iter().enumerate() {
                        dirs.push(TableFiles {
                            dir: format!("{table}-{:032x}", ks_idx * 100 + t_idx + 1),
                            files: vec![
                                (format!("{table}-{generation}-big-Data.db"), 100),
                                (format!("{table}-{generation}-big-Index.db"), 10),
                            ],
                        });
                    }
                    state.local.insert((host.clone(), ks.clone()), dirs);
                }
            }
        }
    }

    pub fn set_ring(&self, keyspace: &str, ring: Ring) {
        self.rings.lock().insert(keyspace.to_string(), ring);
    }

    pub fn set_repair_delay(&self, delay: Duration) {
        *self.repair_delay.lock() = delay;
    }

    pub fn repair_calls(&self) -> Vec<RepairCall> {
        self.state.lock().repair_calls.clone()
    }

    pub fn copy_dir_calls(&self) -> Vec<CopyDirCall> {
        self.state.lock().copy_dir_calls.clone()
    }

    /// Remote paths currently stored, ordered.
    pub fn remote_paths(&self) -> Vec<String> {
        self.state.lock().remote.keys().cloned().collect()
    }
}

/// Builds a ring with two token ranges per replica host and `rf` consecutive
/// replicas per range. `replicated_dcs` confines the replica set, modeling a
/// keyspace whose replication skips datacenters.
pub fn build_ring(dcs: &[(&str, &[&str])], rf: usize, replicated_dcs: Option<&[&str]>) -> Ring {
    let mut host_dc = HashMap::new();
    let mut pool = Vec::new();
    for (dc, hosts) in dcs {
        let replicated = replicated_dcs.map(|r| r.contains(dc)).unwrap_or(true);
        if !replicated {
            continue;
        }
        for h in *hosts {
            host_dc.insert(h.to_string(), dc.to_string());
            pool.push(h.to_string());
        }
    }
    pool.sort();

    let n = pool.len() * 2;
    let rf = rf.min(pool.len()).max(1);
    let step = u64::MAX / n as u64;
    let offset = |i: usize| i64::MIN.wrapping_add((i as u64 * step) as i64);

    let tokens = (0..n)
        .map(|i| TokenRange {
            start_token: offset(i),
            end_token: if i == n - 1 { i64::MAX } else { offset(i + 1) },
            replicas: (0..rf).map(|k| pool[(i + k) % pool.len()].clone()).collect(),
        })
        .collect();

    Ring {
        tokens,
        host_dc,
        replication: ReplicationStrategy::NetworkTopology,
    }
}

#[async_trait]
impl NodeApi for FakeAgent {
    async fn datacenters(&self) -> Result<Datacenters, ManagerError> {
        Ok(self.dcs.clone())
    }

    async fn keyspaces(&self) -> Result<Vec<String>, ManagerError> {
        Ok(self.schema.iter().map(|(ks, _)| ks.clone()).collect())
    }

    async fn tables(&self, keyspace: &str) -> Result<Vec<String>, ManagerError> {
        self.schema
            .iter()
            .find(|(ks, _)| ks == keyspace)
            .map(|(_, tables)| tables.clone())
            .ok_or(ManagerError::NotFound)
    }

    async fn describe_ring(&self, keyspace: &str) -> Result<Ring, ManagerError> {
        self.rings
            .lock()
            .get(keyspace)
            .cloned()
            .ok_or(ManagerError::NotFound)
    }

    async fn ping(&self, host: &str, _timeout: Duration) -> Result<Duration, ManagerError> {
        let state = self.state.lock();
        if state.fail_ping_hosts.contains(host) {
            return Err(ManagerError::Transient(format!("{host}: connect refused")));
        }
        Ok(state
            .ping_latency
            .get(host)
            .copied()
            .unwrap_or(Duration::from_millis(1)))
    }

    async fn node_info(&self, host: &str) -> Result<NodeInfo, ManagerError> {
        Ok(NodeInfo {
            host_id: host_id(host),
            rpc_addr: host.to_string(),
            broadcast_rpc_addr: host.to_string(),
            listen_addr: host.to_string(),
            cql_port: 9042,
            shard_count: self.shard_count,
            agent_version: "fake".to_string(),
        })
    }

    async fn take_snapshot(
        &self,
        host: &str,
        tag: &str,
        _keyspace: &str,
        _tables: &[String],
    ) -> Result<(), ManagerError> {
        self.state
            .lock()
            .snapshots
            .entry(host.to_string())
            .or_default()
            .insert(tag.to_string());
        Ok(())
    }

    async fn snapshots(&self, host: &str) -> Result<Vec<String>, ManagerError> {
        Ok(self
            .state
            .lock()
            .snapshots
            .get(host)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_snapshot(&self, host: &str, tag: &str) -> Result<(), ManagerError> {
        if let Some(tags) = self.state.lock().snapshots.get_mut(host) {
            tags.remove(tag);
        }
        Ok(())
    }

    async fn repair(
        &self,
        host: &str,
        keyspace: &str,
        ranges: &[(i64, i64)],
        _dcs: &[String],
        _hosts: Option<&[String]>,
    ) -> Result<i64, ManagerError> {
        let mut state = self.state.lock();
        if state.busy_hosts.contains(host) {
            return Err(ManagerError::RemoteBusy(format!(
                "active repair on hosts: {host}"
            )));
        }
        state.next_command += 1;
        let id = state.next_command;
        let status = if state.fail_repair_hosts.contains(host) {
            CommandStatus::Failed
        } else {
            CommandStatus::Successful
        };
        state.commands.insert(id, (Instant::now(), status));
        state.repair_calls.push(RepairCall {
            host: host.to_string(),
            keyspace: keyspace.to_string(),
            ranges: ranges.len(),
        });
        Ok(id)
    }

    async fn repair_status(
        &self,
        _host: &str,
        command_id: i64,
    ) -> Result<CommandStatus, ManagerError> {
        let delay = *self.repair_delay.lock();
        let state = self.state.lock();
        match state.commands.get(&command_id) {
            None => Err(ManagerError::NotFound),
            Some((issued, _)) if issued.elapsed() < delay => Ok(CommandStatus::Running),
            Some((_, status)) => Ok(*status),
        }
    }

    async fn kill_all_repairs(&self, _host: &str) -> Result<(), ManagerError> {
        Ok(())
    }

    async fn list_dir(
        &self,
        host: &str,
        path: &str,
        _opts: ListDirOpts,
    ) -> Result<Vec<ListDirItem>, ManagerError> {
        let state = self.state.lock();

        if let Some(rest) = path.strip_prefix("data:") {
            let parts: Vec<&str> = rest.split('/').collect();
            return match parts.as_slice() {
                [ks] => {
                    let dirs = state
                        .local
                        .get(&(host.to_string(), ks.to_string()))
                        .ok_or(ManagerError::NotFound)?;
                    Ok(dirs
                        .iter()
                        .map(|d| ListDirItem {
                            name: d.dir.clone(),
                            path: d.dir.clone(),
                            size: 0,
                            is_dir: true,
                        })
                        .collect())
                }
                [ks, dir, "snapshots", tag] => {
                    let snapshotted = state
                        .snapshots
                        .get(host)
                        .map(|tags| tags.contains(*tag))
                        .unwrap_or(false);
                    if !snapshotted {
                        return Err(ManagerError::NotFound);
                    }
                    let dirs = state
                        .local
                        .get(&(host.to_string(), ks.to_string()))
                        .ok_or(ManagerError::NotFound)?;
                    let table = dirs
                        .iter()
                        .find(|d| d.dir == *dir)
                        .ok_or(ManagerError::NotFound)?;
                    Ok(table
                        .files
                        .iter()
                        .map(|(name, size)| ListDirItem {
                            name: name.clone(),
                            path: name.clone(),
                            size: *size,
                            is_dir: false,
                        })
                        .collect())
                }
                _ => Err(ManagerError::NotFound),
            };
        }

        // Remote listing: files directly under `path`.
        let prefix = format!("{path}/");
        Ok(state
            .remote
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, v)| ListDirItem {
                name: k[prefix.len()..].to_string(),
                path: k[prefix.len()..].to_string(),
                size: v.len() as i64,
                is_dir: false,
            })
            .collect())
    }

    async fn cat(&self, _host: &str, remote_path: &str) -> Result<Vec<u8>, ManagerError> {
        self.state
            .lock()
            .remote
            .get(remote_path)
            .cloned()
            .ok_or(ManagerError::NotFound)
    }

    async fn put(&self, _host: &str, remote_path: &str, body: Bytes) -> Result<(), ManagerError> {
        let mut state = self.state.lock();
        if state
            .fail_put_substrings
            .iter()
            .any(|s| remote_path.contains(s))
        {
            return Err(ManagerError::HttpClient(format!(
                "put {remote_path}: simulated failure"
            )));
        }
        state.remote.insert(remote_path.to_string(), body.to_vec());
        Ok(())
    }

    async fn copy_dir(&self, host: &str, dst: &str, src: &str) -> Result<i64, ManagerError> {
        let mut state = self.state.lock();
        state.copy_dir_calls.push(CopyDirCall {
            host: host.to_string(),
            dst: dst.to_string(),
            src: src.to_string(),
        });

        // Resolve `data:<ks>/<dir>/snapshots/<tag>`.
        let rest = src
            .strip_prefix("data:")
            .ok_or_else(|| ManagerError::Job(format!("bad copy source {src:?}")))?;
        let parts: Vec<&str> = rest.split('/').collect();
        let [ks, dir, "snapshots", _tag] = parts.as_slice() else {
            return Err(ManagerError::Job(format!("bad copy source {src:?}")));
        };
        let files = state
            .local
            .get(&(host.to_string(), ks.to_string()))
            .and_then(|dirs| dirs.iter().find(|d| d.dir == *dir))
            .map(|d| d.files.clone())
            .ok_or(ManagerError::NotFound)?;

        let now = Utc::now().to_rfc3339();
        let mut transfers = Vec::new();
        for (name, size) in files {
            let key = format!("{dst}/{name}");
            let exists = state
                .remote
                .get(&key)
                .map(|v| v.len() as i64 == size)
                .unwrap_or(false);
            if exists {
                transfers.push(FileTransfer {
                    name,
                    size,
                    bytes: 0,
                    checked: true,
                    error: String::new(),
                    started_at: now.clone(),
                    completed_at: now.clone(),
                });
            } else {
                state.remote.insert(key, vec![0u8; size as usize]);
                transfers.push(FileTransfer {
                    name,
                    size,
                    bytes: size,
                    checked: false,
                    error: String::new(),
                    started_at: now.clone(),
                    completed_at: now.clone(),
                });
            }
        }

        state.next_job += 1;
        let id = state.next_job;
        state.jobs.insert(
            id,
            FakeJob {
                transfers,
                finished: true,
                success: true,
                error: String::new(),
            },
        );
        Ok(id)
    }

    async fn job_status(
        &self,
        _host: &str,
        job_id: i64,
        _wait: Duration,
    ) -> Result<JobStatus, ManagerError> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .map(|j| JobStatus {
                finished: j.finished,
                success: j.success,
                error: j.error.clone(),
            })
            .ok_or(ManagerError::NotFound)
    }

    async fn job_stop(&self, _host: &str, job_id: i64) -> Result<(), ManagerError> {
        if let Some(j) = self.state.lock().jobs.get_mut(&job_id) {
            j.finished = true;
        }
        Ok(())
    }

    async fn transferred(
        &self,
        _host: &str,
        group: &str,
    ) -> Result<Vec<FileTransfer>, ManagerError> {
        let id: i64 = group
            .strip_prefix("job/")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        Ok(self
            .state
            .lock()
            .jobs
            .get(&id)
            .map(|j| j.transfers.clone())
            .unwrap_or_default())
    }

    async fn stats(&self, _host: &str, _group: &str) -> Result<TransferStats, ManagerError> {
        Ok(TransferStats::default())
    }

    async fn stats_reset(&self, _host: &str, _group: &str) -> Result<(), ManagerError> {
        Ok(())
    }

    async fn delete_remote_file(
        &self,
        _host: &str,
        remote_path: &str,
    ) -> Result<(), ManagerError> {
        match self.state.lock().remote.remove(remote_path) {
            Some(_) => Ok(()),
            None => Err(ManagerError::NotFound),
        }
    }

    async fn disk_usage(&self, host: &str, _path: &str) -> Result<DiskUsage, ManagerError> {
        let free = self
            .state
            .lock()
            .disk_free_percent
            .get(host)
            .copied()
            .unwrap_or(50);
        Ok(DiskUsage { free, total: 100 })
    }

    async fn set_bandwidth_limit(&self, host: &str, limit: u32) -> Result<(), ManagerError> {
        self.state
            .lock()
            .bandwidth
            .entry(host.to_string())
            .or_default()
            .push(limit);
        Ok(())
    }
}

pub struct FakeProvider {
    pub agent: Arc<FakeAgent>,
}

#[async_trait]
impl ClientProvider for FakeProvider {
    async fn client(&self, _cluster_id: Uuid) -> Result<Arc<dyn NodeApi>, ManagerError> {
        Ok(self.agent.clone() as Arc<dyn NodeApi>)
    }
}

pub struct FakeFactory {
    pub agent: Arc<FakeAgent>,
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn build(
        &self,
        _hosts: &[String],
        _auth_token: Option<&str>,
        _identity: Option<&TlsIdentity>,
    ) -> Result<Arc<dyn NodeApi>, ManagerError> {
        Ok(self.agent.clone() as Arc<dyn NodeApi>)
    }
}

/// A complete in-memory service wiring around one fake agent.
pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub secrets: Arc<MemorySecretStore>,
    pub agent: Arc<FakeAgent>,
    pub provider: Arc<FakeProvider>,
}

impl TestEnv {
    pub fn new(agent: Arc<FakeAgent>) -> Self {
        let provider = Arc::new(FakeProvider {
            agent: agent.clone(),
        });
        Self {
            store: MemoryStore::new(),
            secrets: MemorySecretStore::new(),
            agent,
            provider,
        }
    }

    pub fn repair_service(&self, config: RepairConfig) -> Arc<repair::Service> {
        Arc::new(repair::Service::new(
            self.store.clone(),
            self.provider.clone(),
            config,
        ))
    }

    pub fn backup_service(&self, config: BackupConfig) -> Arc<backup::Service> {
        Arc::new(backup::Service::new(
            self.store.clone(),
            self.provider.clone(),
            config,
        ))
    }
}

pub fn fast_repair_config() -> RepairConfig {
    RepairConfig {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        max_retries: 1,
        segments_per_repair: 4,
        shard_parallel_max: 0,
        ..Default::default()
    }
}

pub fn fast_backup_config() -> BackupConfig {
    BackupConfig {
        poll_interval: Duration::from_millis(10),
        long_polling_timeout: Duration::ZERO,
        ..Default::default()
    }
}
