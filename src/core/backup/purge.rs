// src/core/backup/purge.rs

//! The purge stage: reclaim the node-local snapshot, then enforce retention
//! on the remote store by deleting stale manifests and the data files only
//! they reference. Data files go first and the manifest last, so an
//! interrupted purge leaves a re-listable manifest and the next pass retries.
//! Purge failures are logged and never fail the run on their own.

use super::manifest::{parse_manifest_file_name, ManifestContent};
use super::model::{remote_manifest_dir, snapshot_tag_time, HostInfo};
use super::worker::{hosts_in_parallel, Worker};
use crate::core::client::ListDirOpts;
use crate::core::errors::ManagerError;
use crate::core::parallel;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info};
use uuid::Uuid;

impl Worker<'_> {
    pub(super) async fn purge(&self) -> Result<(), ManagerError> {
        info!("Purging old data...");

        hosts_in_parallel(&self.hosts, parallel::NO_LIMIT, |h| async move {
            info!(host = %h.ip, "Purging old data on host");
            self.purge_host(h).await;
            info!(host = %h.ip, "Done purging old data on host");
            Ok(())
        })
        .await?;

        info!("Done purging old data");
        Ok(())
    }

    async fn purge_host(&self, h: &HostInfo) {
        // The snapshot files are uploaded; drop the node-local copy.
        match self
            .client
            .delete_snapshot(&h.ip, &self.snapshot_tag)
            .await
        {
            Ok(()) => info!(host = %h.ip, tag = %self.snapshot_tag, "Deleted uploaded snapshot"),
            Err(e) => error!(
                host = %h.ip,
                tag = %self.snapshot_tag,
                error = %e,
                "Failed to delete uploaded snapshot"
            ),
        }

        if let Err(e) = self.purge_remote(h).await {
            error!(
                host = %h.ip,
                location = %h.location,
                error = %e,
                "Failed to delete remote stale snapshots"
            );
        }
    }

    async fn purge_remote(&self, h: &HostInfo) -> Result<(), ManagerError> {
        let manifest_dir = remote_manifest_dir(self.cluster_id, &h.dc, &h.id);
        let items = match self
            .client
            .list_dir(
                &h.ip,
                &h.location.remote_path(&manifest_dir),
                ListDirOpts {
                    files_only: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(items) => items,
            // Nothing uploaded for this node yet.
            Err(ManagerError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };

        // Group manifests per task, newest tag first; lexicographic tag order
        // is chronological.
        let mut by_task: HashMap<Uuid, Vec<(String, String)>> = HashMap::new();
        for item in items {
            match parse_manifest_file_name(&item.name) {
                Some((task_id, tag)) => {
                    by_task.entry(task_id).or_default().push((tag, item.name));
                }
                None => {
                    error!(
                        host = %h.ip,
                        location = %h.location,
                        path = %item.name,
                        "Detected unexpected file, it does not belong to the manager"
                    );
                }
            }
        }

        let age_cutoff = self.config.age_max.map(|max| {
            Utc::now() - chrono::Duration::from_std(max).unwrap_or(chrono::Duration::zero())
        });

        let mut keep = Vec::new();
        let mut stale = Vec::new();
        for tags in by_task.values_mut() {
            tags.sort_by(|a, b| b.0.cmp(&a.0));
            for (i, (tag, name)) in tags.iter().enumerate() {
                let expired = match (age_cutoff, snapshot_tag_time(tag)) {
                    (Some(cutoff), Ok(t)) => t < cutoff,
                    _ => false,
                };
                if i >= self.target.retention || expired {
                    stale.push(name.clone());
                } else {
                    keep.push(name.clone());
                }
            }
        }
        if stale.is_empty() {
            info!(host = %h.ip, "No stale backups to purge");
            return Ok(());
        }
        debug!(host = %h.ip, keep = keep.len(), stale = stale.len(), "Found manifests");

        // Files referenced by any kept manifest must survive. Without every
        // kept file list the orphan computation is unsafe, so bail out.
        let mut kept_files: HashSet<String> = HashSet::new();
        let mut kept_schemas: HashSet<String> = HashSet::new();
        for name in &keep {
            let m = self.read_manifest(h, &manifest_dir, name).await?;
            kept_files.extend(m.sst_files(self.cluster_id, &h.dc, &h.id));
            kept_schemas.extend(m.schema.clone());
        }

        let mut deleted_manifests = 0usize;
        let mut deleted_files = 0usize;
        for name in &stale {
            let m = match self.read_manifest(h, &manifest_dir, name).await {
                Ok(m) => m,
                Err(e) => {
                    // Without its file list the manifest's data cannot be
                    // located; leave it for the next pass.
                    error!(host = %h.ip, path = %name, error = %e, "Failed to read stale manifest");
                    continue;
                }
            };

            for f in m.sst_files(self.cluster_id, &h.dc, &h.id) {
                if kept_files.contains(&f) {
                    continue;
                }
                if self.delete_remote(h, &f).await {
                    deleted_files += 1;
                }
            }
            if let Some(schema) = &m.schema {
                if !kept_schemas.contains(schema) {
                    self.delete_remote(h, schema).await;
                }
            }
            if self.delete_remote(h, &format!("{manifest_dir}/{name}")).await {
                deleted_manifests += 1;
            }
        }

        info!(
            host = %h.ip,
            manifests = deleted_manifests,
            files = deleted_files,
            "Purged stale backups"
        );
        Ok(())
    }

    async fn read_manifest(
        &self,
        h: &HostInfo,
        manifest_dir: &str,
        name: &str,
    ) -> Result<ManifestContent, ManagerError> {
        let path = h.location.remote_path(&format!("{manifest_dir}/{name}"));
        let data = self.client.cat(&h.ip, &path).await?;
        let m = ManifestContent::from_gzip(&data)?;
        debug!(host = %h.ip, location = %h.location, path = %name, "Loaded manifest");
        Ok(m)
    }

    /// Deletes one remote object; a missing object counts as deleted.
    async fn delete_remote(&self, h: &HostInfo, path: &str) -> bool {
        debug!(host = %h.ip, path = %path, "Deleting file");
        match self
            .client
            .delete_remote_file(&h.ip, &h.location.remote_path(path))
            .await
        {
            Ok(()) | Err(ManagerError::NotFound) => true,
            Err(e) => {
                error!(host = %h.ip, path = %path, error = %e, "Failed to delete file");
                false
            }
        }
    }
}
