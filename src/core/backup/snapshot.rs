// src/core/backup/snapshot.rs

//! The snapshot stage: gate on free disk space, snapshot every unit under the
//! run's tag, opportunistically drop stale manager snapshots.

use super::model::{is_snapshot_tag, HostInfo, DATA_DIR};
use super::worker::{in_parallel_with_limits, Worker};
use crate::core::errors::ManagerError;
use rand::seq::SliceRandom;
use tracing::{error, info};

impl Worker<'_> {
    pub(super) async fn snapshot(&self) -> Result<(), ManagerError> {
        info!("Taking snapshots...");

        let res = in_parallel_with_limits(&self.hosts, &self.target.snapshot_parallel, |h| async move {
            info!(host = %h.ip, "Taking snapshots on host");
            let res = self.snapshot_host(h).await;
            match &res {
                Ok(()) => info!(host = %h.ip, "Done taking snapshots on host"),
                Err(e) => error!(host = %h.ip, error = %e, "Taking snapshots failed on host"),
            }
            res.map_err(Into::into)
        })
        .await;

        match &res {
            Ok(()) => info!("Done taking snapshots"),
            Err(_) => error!("Taking snapshots failed see exact errors above"),
        }
        res
    }

    async fn snapshot_host(&self, h: &HostInfo) -> Result<(), ManagerError> {
        self.check_cancelled()?;
        self.check_available_disk_space(h).await?;
        self.take_snapshot(h).await?;
        if let Err(e) = self.delete_old_snapshots(h).await {
            // Reclaiming space is opportunistic.
            error!(host = %h.ip, error = %e, "Failed to delete old snapshots");
        }
        Ok(())
    }

    async fn check_available_disk_space(&self, h: &HostInfo) -> Result<(), ManagerError> {
        let du = self.client.disk_usage(&h.ip, DATA_DIR).await?;
        if du.total <= 0 {
            return Err(ManagerError::Structural(format!(
                "host {}: invalid disk usage report",
                h.ip
            )));
        }
        let free_percent = (100 * du.free / du.total) as u8;
        info!(host = %h.ip, percent = free_percent, "Available disk space");
        if free_percent < self.config.disk_space_free_min_percent {
            return Err(ManagerError::InvalidState(format!(
                "host {}: not enough disk space",
                h.ip
            )));
        }
        Ok(())
    }

    async fn take_snapshot(&self, h: &HostInfo) -> Result<(), ManagerError> {
        // A resumed run may have snapshotted this host already.
        let existing = self.client.snapshots(&h.ip).await?;
        if existing.iter().any(|t| t == &self.snapshot_tag) {
            info!(host = %h.ip, tag = %self.snapshot_tag, "Snapshot already taken");
            return Ok(());
        }

        // Snapshotting is costly; randomizing the keyspace order decorrelates
        // disk pressure across the cluster.
        let mut order: Vec<usize> = (0..self.target.units.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        for unit_pos in order {
            let u = &self.target.units[unit_pos];
            info!(
                host = %h.ip,
                keyspace = %u.keyspace,
                tag = %self.snapshot_tag,
                "Taking snapshot"
            );
            let tables: &[String] = if u.all_tables { &[] } else { &u.tables };
            self.client
                .take_snapshot(&h.ip, &self.snapshot_tag, &u.keyspace, tables)
                .await
                .map_err(|e| {
                    ManagerError::Job(format!("keyspace {}: snapshot failed: {e}", u.keyspace))
                })?;
        }
        Ok(())
    }

    async fn delete_old_snapshots(&self, h: &HostInfo) -> Result<(), ManagerError> {
        let tags = self.client.snapshots(&h.ip).await?;

        let mut deleted = Vec::new();
        for t in tags {
            if is_snapshot_tag(&t) && t != self.snapshot_tag {
                self.client.delete_snapshot(&h.ip, &t).await?;
                deleted.push(t);
            }
        }
        if deleted.is_empty() {
            info!(host = %h.ip, "No old snapshots to delete");
        } else {
            info!(host = %h.ip, tags = ?deleted, "Deleted old snapshots");
        }
        Ok(())
    }
}
