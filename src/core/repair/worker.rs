// src/core/repair/worker.rs

//! Executes a repair run: hosts sequentially, shards of a host in parallel,
//! segments of a shard in ordered batches against the node's async repair
//! RPC, with bounded retry and cooperative cancellation.

use super::model::{
    progress_key, Run, SegmentState, ShardProgress, PROGRESS_TABLE,
};
use super::plan::{self, HostPlan, Segment, UnitPlan};
use crate::core::client::{CommandStatus, NodeApi};
use crate::core::errors::ManagerError;
use crate::core::ksfilter::Unit;
use crate::core::parallel::{self, abort, TaskError};
use crate::core::store::{self, DocumentStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) struct Worker<'a> {
    pub store: &'a dyn DocumentStore,
    pub client: Arc<dyn NodeApi>,
    pub run: &'a Run,
    pub ctx: &'a CancellationToken,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub max_retries: usize,
    pub failed_segments: AtomicUsize,
}

impl Worker<'_> {
    pub async fn run(&self) -> Result<(), ManagerError> {
        for (unit_idx, unit) in self.run.target.units.iter().enumerate() {
            if self.ctx.is_cancelled() {
                return Err(ManagerError::Cancelled);
            }
            let plan = self.plan_unit(unit).await?;
            info!(
                keyspace = %plan.keyspace,
                hosts = plan.hosts.len(),
                segments = plan.segment_total(),
                "Repairing keyspace"
            );
            self.repair_unit(unit_idx, &plan).await?;
        }

        let failed = self.failed_segments.load(Ordering::Relaxed);
        if failed > 0 {
            return Err(ManagerError::SegmentsFailed(failed));
        }
        Ok(())
    }

    /// Snapshots the ring and materializes the unit's host/shard plan.
    async fn plan_unit(&self, unit: &Unit) -> Result<UnitPlan, ManagerError> {
        let target = &self.run.target;
        let ring = self.client.describe_ring(&unit.keyspace).await?;
        let segments = plan::build_segments(&ring)?;

        let mut assignments =
            plan::assign_segments(&segments, target.token_ranges, &target.dc, &ring);
        if let Some(host) = &target.host {
            assignments.retain(|h, _| h == host);
        }
        if assignments.is_empty() {
            return Err(ManagerError::Structural(format!(
                "keyspace {}: no replicas in selected datacenters",
                unit.keyspace
            )));
        }

        let mut hosts = Vec::with_capacity(assignments.len());
        for (host, segs) in assignments {
            let node = self.client.node_info(&host).await?;
            if node.shard_count == 0 {
                return Err(ManagerError::Structural(format!(
                    "host {host}: reported zero shards"
                )));
            }
            hosts.push(HostPlan {
                shards: plan::split_to_shards(segs, node.shard_count),
                shard_count: node.shard_count,
                host,
            });
        }
        Ok(UnitPlan {
            keyspace: unit.keyspace.clone(),
            hosts,
        })
    }

    /// Hosts of a unit are repaired one at a time.
    async fn repair_unit(&self, unit_idx: usize, plan: &UnitPlan) -> Result<(), ManagerError> {
        for host_plan in &plan.hosts {
            if self.ctx.is_cancelled() {
                return Err(ManagerError::Cancelled);
            }
            info!(keyspace = %plan.keyspace, host = %host_plan.host, "Repairing host");

            let limit = match self.run.target.shard_parallel_max {
                0 => host_plan.shard_count as usize,
                n => n,
            };
            parallel::run(host_plan.shards.len(), limit, |shard| {
                let segments = &host_plan.shards[shard];
                async move {
                    if segments.is_empty() {
                        return Ok(());
                    }
                    self.repair_shard(
                        unit_idx,
                        &plan.keyspace,
                        &host_plan.host,
                        shard as u32,
                        segments,
                    )
                    .await
                }
            })
            .await?;

            info!(keyspace = %plan.keyspace, host = %host_plan.host, "Done repairing host");
        }
        Ok(())
    }

    async fn repair_shard(
        &self,
        unit_idx: usize,
        keyspace: &str,
        host: &str,
        shard: u32,
        segments: &[Segment],
    ) -> Result<(), TaskError> {
        let mut progress = self
            .load_or_seed_progress(unit_idx, host, shard, segments.len())
            .await
            .map_err(TaskError::Fail)?;

        let pending: Vec<usize> = (0..segments.len())
            .filter(|i| progress.states[*i] != SegmentState::Success)
            .collect();
        debug!(
            host,
            shard,
            pending = pending.len(),
            total = segments.len(),
            "Repairing shard"
        );

        let batch_size = self.run.target.segments_per_repair.max(1);
        for batch in pending.chunks(batch_size) {
            self.repair_batch(keyspace, host, segments, batch, &mut progress)
                .await?;
        }
        Ok(())
    }

    /// Issues one batch against the node and follows it to completion,
    /// retrying the whole batch on transient failures.
    async fn repair_batch(
        &self,
        keyspace: &str,
        host: &str,
        segments: &[Segment],
        batch: &[usize],
        progress: &mut ShardProgress,
    ) -> Result<(), TaskError> {
        for &i in batch {
            progress.states[i] = SegmentState::Running;
        }
        self.save_progress(progress).await.map_err(TaskError::Fail)?;

        let ranges: Vec<(i64, i64)> = batch
            .iter()
            .map(|&i| (segments[i].start_token, segments[i].end_token))
            .collect();

        let mut attempt = 0usize;
        loop {
            if self.ctx.is_cancelled() {
                self.save_progress(progress).await.map_err(TaskError::Fail)?;
                return Err(TaskError::Fail(ManagerError::Cancelled));
            }

            let outcome = match self
                .client
                .repair(host, keyspace, &ranges, &self.run.target.dc, None)
                .await
            {
                Ok(command_id) => {
                    let res = self.wait_command(host, command_id).await;
                    if matches!(&res, Err(ManagerError::Cancelled)) {
                        // Stop the node-side repair instead of orphaning it.
                        if let Err(e) = self.client.kill_all_repairs(host).await {
                            warn!(host, error = %e, "Failed to kill repairs");
                        }
                    }
                    res
                }
                Err(e) => Err(e),
            };

            let failure = match outcome {
                Ok(CommandStatus::Successful) => {
                    for &i in batch {
                        progress.states[i] = SegmentState::Success;
                    }
                    progress.sync_counters();
                    self.save_progress(progress).await.map_err(TaskError::Fail)?;
                    return Ok(());
                }
                Ok(CommandStatus::Failed) => {
                    ManagerError::Job(format!("repair command failed on {host}"))
                }
                Ok(CommandStatus::Running) => unreachable!("wait_command resolves RUNNING"),
                Err(e @ ManagerError::RemoteBusy(_)) => {
                    // An already-running repair on the node fails the run
                    // fast, irrespective of the fail-fast flag.
                    self.save_progress(progress).await.map_err(TaskError::Fail)?;
                    return Err(abort(e));
                }
                Err(ManagerError::Cancelled) => {
                    self.save_progress(progress).await.map_err(TaskError::Fail)?;
                    return Err(TaskError::Fail(ManagerError::Cancelled));
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.max_retries {
                for &i in batch {
                    progress.states[i] = SegmentState::Error;
                }
                progress.sync_counters();
                self.save_progress(progress).await.map_err(TaskError::Fail)?;
                self.failed_segments.fetch_add(batch.len(), Ordering::Relaxed);

                warn!(
                    host,
                    shard = progress.shard,
                    segments = batch.len(),
                    error = %failure,
                    "Batch failed permanently"
                );
                if self.run.target.fail_fast {
                    return Err(abort(failure));
                }
                return Ok(());
            }

            warn!(
                host,
                shard = progress.shard,
                attempt,
                error = %failure,
                "Batch failed, backing off"
            );
            self.sleep_or_cancel(self.error_backoff)
                .await
                .map_err(TaskError::Fail)?;
        }
    }

    /// Polls the repair status endpoint until the command settles.
    async fn wait_command(
        &self,
        host: &str,
        command_id: i64,
    ) -> Result<CommandStatus, ManagerError> {
        loop {
            self.sleep_or_cancel(self.poll_interval).await?;
            match self.client.repair_status(host, command_id).await? {
                CommandStatus::Running => continue,
                status => return Ok(status),
            }
        }
    }

    async fn sleep_or_cancel(&self, d: Duration) -> Result<(), ManagerError> {
        tokio::select! {
            _ = self.ctx.cancelled() => Err(ManagerError::Cancelled),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }

    /// Seeds the shard's progress row, adopting segment states from the
    /// previous run when resuming an identical target.
    async fn load_or_seed_progress(
        &self,
        unit: usize,
        host: &str,
        shard: u32,
        segment_count: usize,
    ) -> Result<ShardProgress, ManagerError> {
        let mut states = vec![SegmentState::Pending; segment_count];

        if let Some(prev_id) = self.run.prev_id {
            let prev_key = progress_key(
                self.run.cluster_id,
                self.run.task_id,
                prev_id,
                unit,
                host,
                shard,
            );
            if let Some(prev) =
                store::get_doc::<ShardProgress>(self.store, PROGRESS_TABLE, &prev_key).await?
            {
                if prev.states.len() == segment_count {
                    // Success carries over; running and error are re-attempted.
                    states = prev
                        .states
                        .iter()
                        .map(|s| match s {
                            SegmentState::Success => SegmentState::Success,
                            _ => SegmentState::Pending,
                        })
                        .collect();
                }
            }
        }

        let mut progress = ShardProgress {
            cluster_id: self.run.cluster_id,
            task_id: self.run.task_id,
            run_id: self.run.id,
            unit,
            host: host.to_string(),
            shard,
            segment_count,
            segment_success: 0,
            segment_error: 0,
            states,
        };
        progress.sync_counters();
        self.save_progress(&progress).await?;
        Ok(progress)
    }

    async fn save_progress(&self, progress: &ShardProgress) -> Result<(), ManagerError> {
        store::put_doc(self.store, PROGRESS_TABLE, &progress.key(), progress).await
    }
}
