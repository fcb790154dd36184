// src/core/backup/mod.rs

//! The backup pipeline: consistent per-host snapshots across the cluster,
//! indexed and uploaded to object storage under a shared snapshot tag with
//! per-host manifests, then reconciled against the retention policy.

pub mod manifest;
pub mod model;

mod index;
mod purge;
mod snapshot;
mod upload;
mod worker;

use crate::core::client::ClientProvider;
use crate::core::errors::ManagerError;
use crate::core::ksfilter::KeyspaceFilter;
use crate::core::runner::{RunStatus, TaskRunner};
use crate::core::store::{self, DocumentStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use model::{
    DCLimit, HostProgress, KeyspaceProgress, Location, Progress, Provider, Run, RunProgress,
    Stage, TableProgress, Target, TaskProperties,
};

use model::{
    filter_dc_limits, filter_dc_locations, new_snapshot_tag, progress_prefix, run_key, HostInfo,
    ProgressTotals, PROGRESS_TABLE, RUN_TABLE,
};
use worker::{prev_progress_key, Worker};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackupConfig {
    /// A host is refused when its data disk has less free space than this.
    #[serde(default = "default_disk_space_free_min_percent")]
    pub disk_space_free_min_percent: u8,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Purge TTL fallback: manifests older than this are stale regardless of
    /// the retention count.
    #[serde(with = "humantime_serde", default)]
    pub age_max: Option<Duration>,
    /// Agent-side long polling window for job status; zero disables it.
    #[serde(with = "humantime_serde", default = "default_long_polling_timeout")]
    pub long_polling_timeout: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            disk_space_free_min_percent: default_disk_space_free_min_percent(),
            poll_interval: default_poll_interval(),
            age_max: None,
            long_polling_timeout: default_long_polling_timeout(),
        }
    }
}

fn default_disk_space_free_min_percent() -> u8 {
    10
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_long_polling_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Plans and executes backup runs.
pub struct Service {
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn ClientProvider>,
    config: BackupConfig,
}

impl Service {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        provider: Arc<dyn ClientProvider>,
        config: BackupConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Resolves task properties into a frozen backup target.
    pub async fn get_target(
        &self,
        cluster_id: Uuid,
        properties: &Value,
    ) -> Result<Target, ManagerError> {
        let props: TaskProperties = serde_json::from_value(properties.clone())
            .map_err(|e| ManagerError::Validation(format!("invalid properties: {e}")))?;

        if props.location.is_empty() {
            return Err(ManagerError::Validation("missing location".into()));
        }
        if props.retention == 0 {
            return Err(ManagerError::Validation(
                "retention must be at least 1".into(),
            ));
        }

        let client = self.provider.client(cluster_id).await?;

        let filter = KeyspaceFilter::new(&props.keyspace)?;
        let mut schema = Vec::new();
        for keyspace in client.keyspaces().await? {
            let tables = client.tables(&keyspace).await?;
            schema.push((keyspace, tables));
        }
        let units = filter.apply(&schema);
        if units.is_empty() {
            return Err(ManagerError::Validation(
                "no keyspace matches the filter".into(),
            ));
        }

        let dc_map = client.datacenters().await?;
        let dc = if props.dc.is_empty() {
            let mut all: Vec<String> = dc_map.keys().cloned().collect();
            all.sort();
            all
        } else {
            for dc in &props.dc {
                if !dc_map.contains_key(dc) {
                    return Err(ManagerError::Validation(format!(
                        "no such datacenter {dc}"
                    )));
                }
            }
            props.dc.clone()
        };

        // Every datacenter referenced by a location or limit must exist.
        for l in &props.location {
            if !l.dc.is_empty() && !dc_map.contains_key(&l.dc) {
                return Err(ManagerError::Validation(format!(
                    "{l}: no such datacenter {}",
                    l.dc
                )));
            }
        }
        for limits in [
            &props.rate_limit,
            &props.snapshot_parallel,
            &props.upload_parallel,
        ] {
            for l in limits {
                if !l.dc.is_empty() && !dc_map.contains_key(&l.dc) {
                    return Err(ManagerError::Validation(format!(
                        "{l}: no such datacenter {}",
                        l.dc
                    )));
                }
            }
        }

        let location = filter_dc_locations(&props.location, &dc);
        check_all_dcs_covered(&location, &dc)?;

        Ok(Target {
            units,
            dc: dc.clone(),
            location,
            retention: props.retention,
            rate_limit: filter_dc_limits(&props.rate_limit, &dc),
            snapshot_parallel: filter_dc_limits(&props.snapshot_parallel, &dc),
            upload_parallel: filter_dc_limits(&props.upload_parallel, &dc),
            continue_: props.continue_,
        })
    }

    /// Executes a backup run to completion, error, or cancellation.
    pub async fn backup(
        &self,
        ctx: &CancellationToken,
        cluster_id: Uuid,
        task_id: Uuid,
        run_id: Uuid,
        target: Target,
    ) -> Result<(), ManagerError> {
        let client = self.provider.client(cluster_id).await?;

        let dc_map = client.datacenters().await?;
        let mut host_addrs: Vec<String> = Vec::new();
        for dc in &target.dc {
            if let Some(hs) = dc_map.get(dc) {
                host_addrs.extend(hs.iter().cloned());
            }
        }
        host_addrs.sort();

        let mut hosts = Vec::with_capacity(host_addrs.len());
        for addr in &host_addrs {
            let node = client.node_info(addr).await?;
            let dc = dc_map
                .iter()
                .find(|(_, hs)| hs.contains(addr))
                .map(|(dc, _)| dc.clone())
                .ok_or_else(|| ManagerError::Structural(format!("{addr}: unknown datacenter")))?;
            let location = target
                .location
                .iter()
                .find(|l| l.dc == dc)
                .or_else(|| target.location.iter().find(|l| l.dc.is_empty()))
                .cloned()
                .ok_or_else(|| ManagerError::Structural(format!("{addr}: unknown location")))?;
            let rate_limit = target
                .rate_limit
                .iter()
                .find(|l| l.dc == dc)
                .or_else(|| target.rate_limit.iter().find(|l| l.dc.is_empty()))
                .cloned()
                .unwrap_or_default();
            hosts.push(HostInfo {
                dc,
                ip: addr.clone(),
                id: node.host_id,
                location,
                rate_limit,
            });
        }

        let mut rings = HashMap::new();
        for u in &target.units {
            rings.insert(u.keyspace.clone(), client.describe_ring(&u.keyspace).await?);
        }

        let mut run = Run {
            cluster_id,
            task_id,
            id: run_id,
            prev_id: None,
            snapshot_tag: new_snapshot_tag(),
            target,
            stage: Stage::Init,
            status: RunStatus::Running,
            cause: String::new(),
            started_at: Utc::now(),
            done_at: None,
        };

        let mut prev_progress = HashMap::new();
        if run.target.continue_ {
            if let Some(prev) = self
                .get_last_resumable_run(cluster_id, task_id, &run.target)
                .await?
            {
                info!(cluster_id = %cluster_id, prev_id = %prev.id, tag = %prev.snapshot_tag, "Resuming previous run");
                run.prev_id = Some(prev.id);
                run.snapshot_tag = prev.snapshot_tag.clone();
                let prefix = progress_prefix(cluster_id, task_id, prev.id);
                for (_, v) in self.store.scan_prefix(PROGRESS_TABLE, &prefix).await? {
                    let p: RunProgress = serde_json::from_value(v)?;
                    prev_progress.insert(prev_progress_key(&p.host, p.unit, &p.table_name), p);
                }
            }
        }
        self.save_run(&run).await?;

        let worker = Worker {
            store: self.store.as_ref(),
            client,
            config: &self.config,
            ctx,
            cluster_id,
            task_id,
            run_id,
            snapshot_tag: run.snapshot_tag.clone(),
            target: run.target.clone(),
            hosts,
            rings,
            snapshot_dirs: Mutex::new(HashMap::new()),
            schema_uploaded: AtomicBool::new(false),
            prev_progress,
        };
        let result = self.run_stages(&worker, &mut run).await;

        match &result {
            Ok(()) => {
                run.stage = Stage::Done;
                run.status = RunStatus::Done;
            }
            Err(e) if e.is_cancelled() => {
                run.status = RunStatus::Stopped;
            }
            Err(e) => {
                run.status = RunStatus::Error;
                run.cause = e.to_string();
            }
        }
        run.done_at = Some(Utc::now());
        self.save_run(&run).await?;

        result
    }

    async fn run_stages(&self, worker: &Worker<'_>, run: &mut Run) -> Result<(), ManagerError> {
        self.set_stage(run, Stage::Snapshot).await?;
        worker.snapshot().await?;

        self.set_stage(run, Stage::Index).await?;
        worker.index().await?;

        self.set_stage(run, Stage::Schema).await?;
        worker.upload_schema().await?;

        self.set_stage(run, Stage::Manifest).await?;
        worker.upload_manifests().await?;

        self.set_stage(run, Stage::Upload).await?;
        worker.upload().await?;

        self.set_stage(run, Stage::Purge).await?;
        worker.purge().await
    }

    async fn set_stage(&self, run: &mut Run, stage: Stage) -> Result<(), ManagerError> {
        debug!(run_id = %run.id, stage = %stage, "Entering stage");
        run.stage = stage;
        self.save_run(run).await
    }

    async fn save_run(&self, run: &Run) -> Result<(), ManagerError> {
        store::put_doc(self.store.as_ref(), RUN_TABLE, &run.key(), run).await
    }

    pub async fn get_run(
        &self,
        cluster_id: Uuid,
        task_id: Uuid,
        run_id: Uuid,
    ) -> Result<Run, ManagerError> {
        store::get_doc(
            self.store.as_ref(),
            RUN_TABLE,
            &run_key(cluster_id, task_id, run_id),
        )
        .await?
        .ok_or(ManagerError::NotFound)
    }

    /// The newest run of the task that an identical target may resume.
    async fn get_last_resumable_run(
        &self,
        cluster_id: Uuid,
        task_id: Uuid,
        target: &Target,
    ) -> Result<Option<Run>, ManagerError> {
        let prefix = format!("{cluster_id}/{task_id}/");
        let rows = self.store.scan_prefix(RUN_TABLE, &prefix).await?;
        let Some((_, v)) = rows.into_iter().next_back() else {
            return Ok(None);
        };
        let run: Run = serde_json::from_value(v)?;
        let resumable = matches!(
            run.status,
            RunStatus::Running | RunStatus::Stopped | RunStatus::Error
        );
        if resumable && run.target.same_scope(target) {
            Ok(Some(run))
        } else {
            Ok(None)
        }
    }

    /// Aggregates the run's upload progress rows into host and keyspace
    /// rollups.
    pub async fn get_progress(
        &self,
        cluster_id: Uuid,
        task_id: Uuid,
        run_id: Uuid,
    ) -> Result<Progress, ManagerError> {
        let run = self.get_run(cluster_id, task_id, run_id).await?;

        let prefix = progress_prefix(cluster_id, task_id, run_id);
        let rows = self.store.scan_prefix(PROGRESS_TABLE, &prefix).await?;

        let mut by_host: HashMap<String, Vec<RunProgress>> = HashMap::new();
        for (_, v) in rows {
            let p: RunProgress = serde_json::from_value(v)?;
            by_host.entry(p.host.clone()).or_default().push(p);
        }

        let mut progress = Progress {
            snapshot_tag: run.snapshot_tag.clone(),
            dc: run.target.dc.clone(),
            totals: ProgressTotals::default(),
            hosts: Vec::new(),
        };

        let mut host_names: Vec<&String> = by_host.keys().collect();
        host_names.sort();
        for host in host_names {
            let mut host_progress = HostProgress {
                host: host.clone(),
                totals: ProgressTotals::default(),
                keyspaces: Vec::new(),
            };
            let mut by_unit: HashMap<usize, Vec<&RunProgress>> = HashMap::new();
            for p in &by_host[host] {
                by_unit.entry(p.unit).or_default().push(p);
            }
            let mut unit_idxs: Vec<usize> = by_unit.keys().copied().collect();
            unit_idxs.sort();
            for unit_idx in unit_idxs {
                let keyspace = run
                    .target
                    .units
                    .get(unit_idx)
                    .map(|u| u.keyspace.clone())
                    .unwrap_or_default();
                let mut ks_progress = KeyspaceProgress {
                    keyspace,
                    totals: ProgressTotals::default(),
                    tables: Vec::new(),
                };
                let mut tables = by_unit[&unit_idx].clone();
                tables.sort_by(|a, b| a.table_name.cmp(&b.table_name));
                for p in tables {
                    let mut totals = ProgressTotals::default();
                    totals.add(p);
                    ks_progress.totals.add(p);
                    host_progress.totals.add(p);
                    progress.totals.add(p);
                    ks_progress.tables.push(TableProgress {
                        table: p.table_name.clone(),
                        totals,
                        error: p.error.clone(),
                    });
                }
                host_progress.keyspaces.push(ks_progress);
            }
            progress.hosts.push(host_progress);
        }

        Ok(progress)
    }
}

fn check_all_dcs_covered(locations: &[Location], dcs: &[String]) -> Result<(), ManagerError> {
    if locations.iter().any(|l| l.dc.is_empty()) {
        return Ok(());
    }
    let covered: Vec<&String> = locations.iter().map(|l| &l.dc).collect();
    let missing: Vec<&str> = dcs
        .iter()
        .filter(|dc| !covered.contains(dc))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ManagerError::Validation(format!(
            "missing location(s) for datacenters {}",
            missing.join(", ")
        )))
    }
}

#[async_trait]
impl TaskRunner for Service {
    type Target = Target;

    async fn get_target(
        &self,
        cluster_id: Uuid,
        properties: &Value,
    ) -> Result<Target, ManagerError> {
        Service::get_target(self, cluster_id, properties).await
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        cluster_id: Uuid,
        task_id: Uuid,
        run_id: Uuid,
        target: Target,
    ) -> Result<(), ManagerError> {
        self.backup(ctx, cluster_id, task_id, run_id, target).await
    }
}
