// src/core/repair/mod.rs

//! The repair orchestrator: executes a user-scoped anti-entropy sweep over
//! selected keyspaces under per-node and per-shard parallelism bounds, with
//! resumability, bounded retry, and segment-level progress accounting.

pub mod model;
pub mod plan;
mod worker;

use crate::core::client::ClientProvider;
use crate::core::errors::ManagerError;
use crate::core::ksfilter::KeyspaceFilter;
use crate::core::runner::TaskRunner;
use crate::core::store::{self, DocumentStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use model::{
    percent, NodeProgress, Progress, Run, RunStatus, ShardProgress, Target, TaskProperties,
    TokenRangesKind, UnitProgress,
};

use model::{progress_prefix, run_key, ShardView, PROGRESS_TABLE, RUN_TABLE};
use worker::Worker;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RepairConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_error_backoff")]
    pub error_backoff: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Node-side ranges issued per repair invocation.
    #[serde(default = "default_segments_per_repair")]
    pub segments_per_repair: usize,
    /// Concurrently repaired shards of a host; `0` means the node shard count.
    #[serde(default)]
    pub shard_parallel_max: usize,
    /// Reserved segment-count target per shard; the planner does not consult it.
    #[serde(default = "default_shard_bound")]
    pub shard_bound: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            error_backoff: default_error_backoff(),
            max_retries: default_max_retries(),
            segments_per_repair: default_segments_per_repair(),
            shard_parallel_max: 0,
            shard_bound: default_shard_bound(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}
fn default_error_backoff() -> Duration {
    Duration::from_secs(10)
}
fn default_max_retries() -> usize {
    3
}
fn default_segments_per_repair() -> usize {
    16
}
fn default_shard_bound() -> usize {
    4000
}

/// Plans and executes repair runs.
pub struct Service {
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn ClientProvider>,
    config: RepairConfig,
}

impl Service {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        provider: Arc<dyn ClientProvider>,
        config: RepairConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Resolves task properties into a frozen repair target.
    pub async fn get_target(
        &self,
        cluster_id: Uuid,
        properties: &Value,
    ) -> Result<Target, ManagerError> {
        let props: TaskProperties = serde_json::from_value(properties.clone())
            .map_err(|e| ManagerError::Validation(format!("invalid properties: {e}")))?;

        let client = self.provider.client(cluster_id).await?;

        // Candidate units from the schema, narrowed by the glob filters.
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

        // Drop keyspaces whose replica set within the selected datacenters is
        // empty; fail when nothing is left.
        let mut kept = Vec::new();
        for unit in units {
            let ring = client.describe_ring(&unit.keyspace).await?;
            let replicated = ring.tokens.iter().any(|t| {
                t.replicas.iter().any(|r| {
                    ring.host_dc
                        .get(r)
                        .map(|d| dc.contains(d))
                        .unwrap_or(false)
                })
            });
            if replicated {
                kept.push(unit);
            } else {
                info!(
                    keyspace = %unit.keyspace,
                    "Skipping keyspace with no replicas in selected datacenters"
                );
            }
        }
        if kept.is_empty() {
            return Err(ManagerError::Structural(
                "no keyspace replicated in selected datacenters".into(),
            ));
        }

        if let Some(host) = &props.host {
            let known = dc
                .iter()
                .filter_map(|d| dc_map.get(d))
                .any(|hosts| hosts.contains(host));
            if !known {
                return Err(ManagerError::Validation(format!(
                    "host {host} does not belong to the selected datacenters"
                )));
            }
        }

        Ok(Target {
            units: kept,
            dc,
            host: props.host,
            token_ranges: props.token_ranges,
            fail_fast: props.fail_fast,
            continue_: props.continue_,
            segments_per_repair: props
                .segments_per_repair
                .unwrap_or(self.config.segments_per_repair)
                .max(1),
            shard_parallel_max: props
                .shard_parallel_max
                .unwrap_or(self.config.shard_parallel_max),
        })
    }

    /// Executes a repair run to completion, error, or cancellation.
    pub async fn repair(
        &self,
        ctx: &CancellationToken,
        cluster_id: Uuid,
        task_id: Uuid,
        run_id: Uuid,
        target: Target,
    ) -> Result<(), ManagerError> {
        let client = self.provider.client(cluster_id).await?;

        let mut run = Run {
            cluster_id,
            task_id,
            id: run_id,
            prev_id: None,
            target,
            status: RunStatus::Running,
            cause: String::new(),
            started_at: Utc::now(),
            done_at: None,
        };

        if run.target.continue_ {
            if let Some(prev) = self
                .get_last_resumable_run(cluster_id, task_id, &run.target)
                .await?
            {
                info!(cluster_id = %cluster_id, prev_id = %prev.id, "Resuming previous run");
                run.prev_id = Some(prev.id);
            }
        }
        store::put_doc(self.store.as_ref(), RUN_TABLE, &run.key(), &run).await?;

        let worker = Worker {
            store: self.store.as_ref(),
            client,
            run: &run,
            ctx,
            poll_interval: self.config.poll_interval,
            error_backoff: self.config.error_backoff,
            max_retries: self.config.max_retries,
            failed_segments: AtomicUsize::new(0),
        };
        let result = worker.run().await;

        match &result {
            Ok(()) => {
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
        store::put_doc(self.store.as_ref(), RUN_TABLE, &run.key(), &run).await?;

        result
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

    /// The newest run of the task that an identical target continues from.
    /// A completed run counts: its segments are all in success state, so
    /// re-running the same target becomes a no-op sweep. A re-scoped newest
    /// run means a fresh plan.
    async fn get_last_resumable_run(
        &self,
        cluster_id: Uuid,
        task_id: Uuid,
        target: &Target,
    ) -> Result<Option<Run>, ManagerError> {
        let prefix = format!("{cluster_id}/{task_id}/");
        let rows = self.store.scan_prefix(RUN_TABLE, &prefix).await?;
        // Run ids are time ordered, so the last row is the newest run.
        let Some((_, v)) = rows.into_iter().next_back() else {
            return Ok(None);
        };
        let run: Run = serde_json::from_value(v)?;
        if run.status != RunStatus::New && run.target.same_scope(target) {
            Ok(Some(run))
        } else {
            Ok(None)
        }
    }

    /// Aggregates the run's shard progress rows into per-unit and per-node
    /// rollups. Percentages are computed on read.
    pub async fn get_progress(
        &self,
        cluster_id: Uuid,
        task_id: Uuid,
        run_id: Uuid,
    ) -> Result<Progress, ManagerError> {
        let run = self.get_run(cluster_id, task_id, run_id).await?;

        let prefix = progress_prefix(cluster_id, task_id, run_id);
        let rows = self.store.scan_prefix(PROGRESS_TABLE, &prefix).await?;
        debug!(cluster_id = %cluster_id, run_id = %run_id, rows = rows.len(), "Aggregating progress");

        let mut by_unit: HashMap<usize, HashMap<String, Vec<ShardProgress>>> = HashMap::new();
        for (_, v) in rows {
            let p: ShardProgress = serde_json::from_value(v)?;
            by_unit
                .entry(p.unit)
                .or_default()
                .entry(p.host.clone())
                .or_default()
                .push(p);
        }

        let mut units = Vec::new();
        let (mut total, mut ok, mut failed) = (0usize, 0usize, 0usize);
        for (unit_idx, unit) in run.target.units.iter().enumerate() {
            let mut nodes = Vec::new();
            let (mut u_total, mut u_ok, mut u_failed) = (0usize, 0usize, 0usize);
            if let Some(hosts) = by_unit.get(&unit_idx) {
                let mut host_names: Vec<&String> = hosts.keys().collect();
                host_names.sort();
                for host in host_names {
                    let mut shards = hosts[host].clone();
                    shards.sort_by_key(|s| s.shard);
                    let (mut n_total, mut n_ok, mut n_failed) = (0usize, 0usize, 0usize);
                    let views: Vec<ShardView> = shards
                        .iter()
                        .map(|s| {
                            n_total += s.segment_count;
                            n_ok += s.segment_success;
                            n_failed += s.segment_error;
                            ShardView {
                                shard: s.shard,
                                segment_count: s.segment_count,
                                segment_success: s.segment_success,
                                segment_error: s.segment_error,
                                percent_complete: percent(s.segment_success, s.segment_count),
                                percent_failed: percent(s.segment_error, s.segment_count),
                            }
                        })
                        .collect();
                    u_total += n_total;
                    u_ok += n_ok;
                    u_failed += n_failed;
                    nodes.push(NodeProgress {
                        host: host.clone(),
                        percent_complete: percent(n_ok, n_total),
                        percent_failed: percent(n_failed, n_total),
                        shards: views,
                    });
                }
            }
            total += u_total;
            ok += u_ok;
            failed += u_failed;
            units.push(UnitProgress {
                keyspace: unit.keyspace.clone(),
                percent_complete: percent(u_ok, u_total),
                percent_failed: percent(u_failed, u_total),
                nodes,
            });
        }

        Ok(Progress {
            units,
            percent_complete: percent(ok, total),
            percent_failed: percent(failed, total),
        })
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
        self.repair(ctx, cluster_id, task_id, run_id, target).await
    }
}
