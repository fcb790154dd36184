// src/core/backup/index.rs

//! The index stage: discover versioned table snapshot directories on every
//! host and seed the per-table progress rows with their total bytes.

use super::model::{keyspace_dir, HostInfo, RunProgress, SnapshotDir};
use super::worker::{in_parallel_with_limits, Worker};
use crate::core::client::ListDirOpts;
use crate::core::errors::ManagerError;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info};

/// `<table>-<32-hex-id>` versioned table directory name.
static TABLE_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9_]+)-([a-f0-9]{32})$").unwrap());

impl Worker<'_> {
    pub(super) async fn index(&self) -> Result<(), ManagerError> {
        info!("Indexing snapshot files...");

        let res = in_parallel_with_limits(&self.hosts, &self.target.upload_parallel, |h| async move {
            info!(host = %h.ip, "Indexing snapshot files on host");
            match self.index_snapshot_dirs(h).await {
                Ok(dirs) => {
                    info!(host = %h.ip, count = dirs.len(), "Done indexing snapshot files on host");
                    self.snapshot_dirs.lock().insert(h.ip.clone(), dirs);
                    Ok(())
                }
                Err(e) => {
                    error!(host = %h.ip, error = %e, "Indexing snapshot files failed on host");
                    Err(e.into())
                }
            }
        })
        .await;

        match &res {
            Ok(()) => info!("Done indexing snapshot files"),
            Err(_) => error!("Indexing snapshot files failed see exact errors above"),
        }
        res
    }

    async fn index_snapshot_dirs(&self, h: &HostInfo) -> Result<Vec<SnapshotDir>, ManagerError> {
        let mut dirs = Vec::new();

        for (unit_idx, u) in self.target.units.iter().enumerate() {
            debug!(
                host = %h.ip,
                tag = %self.snapshot_tag,
                keyspace = %u.keyspace,
                "Finding table snapshot directories"
            );

            let base_dir = keyspace_dir(&u.keyspace);
            let tables = self
                .client
                .list_dir(&h.ip, &base_dir, ListDirOpts::default())
                .await
                .map_err(|e| {
                    ManagerError::Job(format!("list keyspace {}: {e}", u.keyspace))
                })?;

            for t in tables {
                let Some(m) = TABLE_DIR_RE.captures(&t.path) else {
                    continue;
                };
                let table = m[1].to_string();
                let version = m[2].to_string();

                if !u.all_tables && !u.tables.contains(&table) {
                    continue;
                }

                let path = format!("{base_dir}/{}/snapshots/{}", t.path, self.snapshot_tag);
                let files = match self
                    .client
                    .list_dir(
                        &h.ip,
                        &path,
                        ListDirOpts {
                            files_only: true,
                            ..Default::default()
                        },
                    )
                    .await
                {
                    Ok(files) => files,
                    // A table with no snapshot directory has no data at this tag.
                    Err(ManagerError::NotFound) => continue,
                    Err(e) => return Err(ManagerError::Job(format!("list table {table}: {e}"))),
                };

                debug!(
                    host = %h.ip,
                    tag = %self.snapshot_tag,
                    keyspace = %u.keyspace,
                    table = %table,
                    dir = %path,
                    "Found snapshot directory"
                );

                let mut file_names = Vec::with_capacity(files.len());
                let mut size = 0i64;
                for f in files {
                    file_names.push(f.name);
                    size += f.size;
                }

                let mut progress = RunProgress {
                    cluster_id: self.cluster_id,
                    task_id: self.task_id,
                    run_id: self.run_id,
                    host: h.ip.clone(),
                    unit: unit_idx,
                    table_name: table.clone(),
                    files: file_names,
                    size,
                    ..Default::default()
                };
                // Carry the previous run's job handle so the upload stage can
                // attach to a still-running agent job.
                if let Some(prev) = self.prev_progress(&h.ip, unit_idx, &table) {
                    progress.agent_job_id = prev.agent_job_id;
                    progress.uploaded = prev.uploaded;
                    progress.skipped = prev.skipped;
                }
                self.save_progress(&progress).await?;

                dirs.push(SnapshotDir {
                    host: h.ip.clone(),
                    unit: unit_idx,
                    path,
                    keyspace: u.keyspace.clone(),
                    table,
                    version,
                    progress,
                });
            }
        }

        debug!(host = %h.ip, count = dirs.len(), "Found snapshot directories");
        Ok(dirs)
    }
}
