// src/core/backup/upload.rs

//! The data upload stage: rate-limit the agent, copy every snapshot
//! directory to the remote location as an asynchronous agent job, follow the
//! job aggregating transfer reports into progress, and attach to jobs left
//! running by an interrupted run instead of restarting them.

use super::model::{remote_sstable_version_dir, HostInfo, SnapshotDir};
use super::worker::{in_parallel_with_limits, Worker};
use crate::core::client::model::{file_transfers, job_group};
use crate::core::errors::ManagerError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

impl Worker<'_> {
    pub(super) async fn upload(&self) -> Result<(), ManagerError> {
        info!("Starting upload procedure");

        let res = in_parallel_with_limits(&self.hosts, &self.target.upload_parallel, |h| async move {
            info!(host = %h.ip, "Executing upload procedure on host");
            let res = self.upload_host(h).await;
            match &res {
                Ok(()) => info!(host = %h.ip, "Done executing upload procedure on host"),
                Err(e) => error!(host = %h.ip, error = %e, "Upload procedure failed on host"),
            }
            res.map_err(Into::into)
        })
        .await;

        match &res {
            Ok(()) => info!("Upload procedure completed"),
            Err(_) => error!("Upload procedure completed with error(s) see exact errors above"),
        }
        res
    }

    async fn upload_host(&self, h: &HostInfo) -> Result<(), ManagerError> {
        self.set_rate_limit(h).await?;

        let dirs = self
            .snapshot_dirs
            .lock()
            .get(&h.ip)
            .cloned()
            .unwrap_or_default();

        let mut result = Ok(());
        for mut d in dirs {
            self.check_cancelled()?;
            let attached = self.attach_to_job(h, &mut d).await?;
            if !attached {
                if let Err(e) = self.upload_snapshot_dir(h, &mut d).await {
                    result = Err(e);
                    break;
                }
            }
        }

        // The cap is scoped to the stage.
        if let Err(e) = self.client.set_bandwidth_limit(&h.ip, 0).await {
            warn!(host = %h.ip, error = %e, "Failed to clear rate limit");
        }
        result
    }

    async fn set_rate_limit(&self, h: &HostInfo) -> Result<(), ManagerError> {
        info!(host = %h.ip, limit = h.rate_limit.limit, "Setting rate limit");
        self.client
            .set_bandwidth_limit(&h.ip, h.rate_limit.limit)
            .await
    }

    /// Adopts the previous run's agent job when it is still running or has
    /// already succeeded, so no second copy of the directory is issued.
    /// Returns true when the directory is covered by the adopted job.
    async fn attach_to_job(
        &self,
        h: &HostInfo,
        d: &mut SnapshotDir,
    ) -> Result<bool, ManagerError> {
        let job_id = d.progress.agent_job_id;
        if job_id == 0 || d.progress.uploaded >= d.progress.size {
            return Ok(false);
        }

        let status = match self.client.job_status(&h.ip, job_id, Duration::ZERO).await {
            Ok(s) => s,
            // Gone or unreadable jobs are restarted from scratch.
            Err(_) => return Ok(false),
        };
        if status.finished && !status.success {
            return Ok(false);
        }

        info!(
            host = %h.ip,
            keyspace = %d.keyspace,
            tag = %self.snapshot_tag,
            job_id,
            "Attaching to the previous agent job"
        );
        if status.finished {
            self.update_progress(&h.ip, job_id, d).await;
            return Ok(true);
        }
        self.wait_job(h, job_id, d).await?;
        Ok(true)
    }

    async fn upload_snapshot_dir(
        &self,
        h: &HostInfo,
        d: &mut SnapshotDir,
    ) -> Result<(), ManagerError> {
        info!(
            host = %h.ip,
            keyspace = %d.keyspace,
            table = %d.table,
            location = %h.location,
            "Uploading table snapshot"
        );

        let dst = h.location.remote_path(&remote_sstable_version_dir(
            self.cluster_id,
            &h.dc,
            &h.id,
            &d.keyspace,
            &d.table,
            &d.version,
        ));
        let src = d.path.clone();

        let job_id = self
            .client
            .copy_dir(&h.ip, &dst, &src)
            .await
            .map_err(|e| ManagerError::Job(format!("copy {src:?} to {dst:?}: {e}")))?;
        debug!(host = %h.ip, from = %src, to = %dst, job_id, "Uploading dir");

        d.progress.agent_job_id = job_id;
        self.save_progress(&d.progress).await?;

        self.wait_job(h, job_id, d).await
    }

    /// Polls the job until it settles, refreshing progress on every poll. On
    /// cancellation the remote job is stopped and last-known progress kept.
    async fn wait_job(
        &self,
        h: &HostInfo,
        job_id: i64,
        d: &mut SnapshotDir,
    ) -> Result<(), ManagerError> {
        let result = loop {
            tokio::select! {
                _ = self.ctx.cancelled() => {
                    if let Err(e) = self.client.job_stop(&h.ip, job_id).await {
                        error!(
                            host = %h.ip,
                            unit = d.unit,
                            table = %d.table,
                            job_id,
                            error = %e,
                            "Failed to stop agent job"
                        );
                    }
                    self.update_progress(&h.ip, job_id, d).await;
                    break Err(ManagerError::Cancelled);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self
                        .client
                        .job_status(&h.ip, job_id, self.config.long_polling_timeout)
                        .await
                    {
                        Err(ManagerError::NotFound) => {
                            break Err(ManagerError::Job(format!("job not found ({job_id})")));
                        }
                        Err(e) => {
                            error!(
                                host = %h.ip,
                                unit = d.unit,
                                table = %d.table,
                                job_id,
                                error = %e,
                                "Failed to fetch job status"
                            );
                            break Err(e);
                        }
                        Ok(s) if s.finished && s.success => {
                            self.update_progress(&h.ip, job_id, d).await;
                            break Ok(());
                        }
                        Ok(s) if s.finished => {
                            break Err(ManagerError::Job(s.error));
                        }
                        Ok(_) => {
                            self.update_progress(&h.ip, job_id, d).await;
                        }
                    }
                }
            }
        };

        debug!(host = %h.ip, job_id, "Clearing job stats");
        if let Err(e) = self.client.stats_reset(&h.ip, &job_group(job_id)).await {
            debug!(host = %h.ip, job_id, error = %e, "Failed to clear job stats");
        }
        result
    }

    /// Rebuilds the progress row from the agent's transfer reports. Every
    /// file maps to zero (in flight), one (check or transfer), or two (check
    /// then transfer) entries.
    async fn update_progress(&self, host: &str, job_id: i64, d: &mut SnapshotDir) {
        let group = job_group(job_id);

        let transferred = match self.client.transferred(host, &group).await {
            Ok(t) => t,
            Err(e) => {
                error!(host, job_id, error = %e, "Failed to get transferred files");
                return;
            }
        };
        let stats = match self.client.stats(host, &group).await {
            Ok(s) => s,
            Err(e) => {
                error!(host, job_id, error = %e, "Failed to get transfer stats");
                return;
            }
        };

        let transferring_bytes: HashMap<&str, i64> = stats
            .transferring
            .iter()
            .map(|t| (t.name.as_str(), t.bytes))
            .collect();
        let entries = file_transfers(transferred);

        let p = &mut d.progress;
        p.started_at = None;
        p.completed_at = None;
        p.error.clear();
        p.uploaded = 0;
        p.skipped = 0;
        p.failed = 0;

        let mut errs: Vec<String> = Vec::new();
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut completed_at: Option<DateTime<Utc>> = None;
        let mut completed = true;

        let mut note_started = |s: &str| {
            if let Some(t) = parse_time(host, job_id, s) {
                started_at = Some(started_at.map_or(t, |cur| cur.min(t)));
            }
        };
        let mut note_completed = |s: &str| match parse_time(host, job_id, s) {
            Some(t) => completed_at = Some(completed_at.map_or(t, |cur| cur.max(t))),
            None => completed = false,
        };

        for f in &p.files {
            let ft = entries.get(f).map(Vec::as_slice).unwrap_or(&[]);
            match ft {
                [] => {
                    // Not reported as transferred yet, inspect in-flight bytes.
                    p.uploaded += transferring_bytes.get(f.as_str()).copied().unwrap_or(0);
                }
                [only] => {
                    note_started(&only.started_at);
                    note_completed(&only.completed_at);

                    if !only.error.is_empty() {
                        p.failed += only.size - only.bytes;
                        errs.push(format!("{f} {}", only.error));
                    }
                    if only.checked {
                        // Already at the destination, merely verified.
                        p.skipped += only.size;
                    } else {
                        p.uploaded += only.bytes;
                    }
                }
                [check, transfer, ..] => {
                    // Found and updated on remote: a check followed by a
                    // transfer. Times span from the check's start to the
                    // transfer's completion.
                    note_started(&check.started_at);
                    note_completed(&transfer.completed_at);

                    let mut failed = false;
                    if !check.error.is_empty() {
                        failed = true;
                        errs.push(format!("{f} {}", check.error));
                    }
                    if !transfer.error.is_empty() {
                        failed = true;
                        errs.push(format!("{f} {}", transfer.error));
                    }
                    if failed {
                        p.failed += transfer.size - transfer.bytes;
                    }
                    p.uploaded += transfer.bytes;
                }
            }
        }

        if !errs.is_empty() {
            p.error = errs.join("; ");
        }
        p.started_at = started_at;
        if completed {
            p.completed_at = completed_at;
        }

        if let Err(e) = self.save_progress(p).await {
            error!(host, job_id, error = %e, "Failed to persist progress");
        }
    }
}

fn parse_time(host: &str, job_id: i64, s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(s) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            error!(host, job_id, value = s, error = %e, "Failed to parse transfer time");
            None
        }
    }
}
