// src/core/backup/worker.rs

//! Shared state of one backup run and the per-datacenter parallel fan-out
//! helpers the stages schedule their host work with.

use super::model::{DCLimit, HostInfo, RunProgress, SnapshotDir, Target, PROGRESS_TABLE};
use super::BackupConfig;
use crate::core::client::{NodeApi, Ring};
use crate::core::errors::ManagerError;
use crate::core::parallel::{self, TaskError};
use crate::core::store::{self, DocumentStore};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Executes the stages of one backup run. Stage methods live next to their
/// stage logic: `snapshot.rs`, `index.rs`, `manifest.rs`, `upload.rs`,
/// `purge.rs`.
pub(super) struct Worker<'a> {
    pub store: &'a dyn DocumentStore,
    pub client: Arc<dyn NodeApi>,
    pub config: &'a BackupConfig,
    pub ctx: &'a CancellationToken,

    pub cluster_id: Uuid,
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub snapshot_tag: String,
    pub target: Target,

    pub hosts: Vec<HostInfo>,
    /// Ring snapshot per keyspace, taken at plan time.
    pub rings: HashMap<String, Ring>,
    /// Snapshot directories discovered by the index stage, per host address.
    pub snapshot_dirs: Mutex<HashMap<String, Vec<SnapshotDir>>>,
    pub schema_uploaded: AtomicBool,
    /// Progress rows of the resumed previous run, keyed by
    /// `host/unit/table`, used to attach to in-flight agent jobs.
    pub prev_progress: HashMap<String, RunProgress>,
}

impl Worker<'_> {
    pub fn check_cancelled(&self) -> Result<(), ManagerError> {
        if self.ctx.is_cancelled() {
            Err(ManagerError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn save_progress(&self, progress: &RunProgress) -> Result<(), ManagerError> {
        store::put_doc(self.store, PROGRESS_TABLE, &progress.key(), progress).await
    }

    /// The resumed run's progress row for `(host, unit, table)`, if any.
    pub fn prev_progress(&self, host: &str, unit: usize, table: &str) -> Option<&RunProgress> {
        self.prev_progress.get(&format!("{host}/{unit}/{table}"))
    }
}

pub(super) fn prev_progress_key(host: &str, unit: usize, table: &str) -> String {
    format!("{host}/{unit}/{table}")
}

/// Runs `f` over all hosts with a flat parallelism bound.
pub(super) async fn hosts_in_parallel<'h, F, Fut>(
    hosts: &'h [HostInfo],
    limit: usize,
    f: F,
) -> Result<(), ManagerError>
where
    F: Fn(&'h HostInfo) -> Fut,
    Fut: Future<Output = Result<(), TaskError>>,
{
    parallel::run(hosts.len(), limit, |i| f(&hosts[i])).await
}

/// Runs `f` over all hosts, grouped by datacenter, each group bounded by its
/// datacenter's limit (an untagged limit is the default, none is unbounded).
/// Groups run concurrently; a limit of `0` is unbounded.
pub(super) async fn in_parallel_with_limits<'h, F, Fut>(
    hosts: &'h [HostInfo],
    limits: &[DCLimit],
    f: F,
) -> Result<(), ManagerError>
where
    F: Fn(&'h HostInfo) -> Fut,
    Fut: Future<Output = Result<(), TaskError>>,
{
    let mut groups: BTreeMap<&str, Vec<&'h HostInfo>> = BTreeMap::new();
    for h in hosts {
        groups.entry(h.dc.as_str()).or_default().push(h);
    }
    let groups: Vec<(&str, Vec<&'h HostInfo>)> = groups.into_iter().collect();

    let default_limit = limits
        .iter()
        .find(|l| l.dc.is_empty())
        .map(|l| l.limit as usize)
        .unwrap_or(parallel::NO_LIMIT);

    let f = &f;
    parallel::run(groups.len(), parallel::NO_LIMIT, |gi| {
        let (dc, group) = &groups[gi];
        let limit = limits
            .iter()
            .find(|l| l.dc == *dc)
            .map(|l| l.limit as usize)
            .unwrap_or(default_limit);
        async move {
            parallel::run(group.len(), limit, |i| f(group[i]))
                .await
                .map_err(TaskError::Fail)
        }
    })
    .await
}
