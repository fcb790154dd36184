// src/core/backup/manifest.rs

//! The v2 per-host manifest: a gzipped JSON index of one host's snapshot at
//! one tag, stored at a deterministic remote path. Also the manifest and
//! schema upload stages.

use super::model::{
    remote_manifest_file, remote_schema_file, remote_sstable_version_dir, HostInfo,
};
use super::worker::{in_parallel_with_limits, Worker};
use crate::core::errors::ManagerError;
use crate::core::parallel::{abort, TaskError};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use uuid::Uuid;

/// Per-table file index entry of a manifest.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FilesMeta {
    pub keyspace: String,
    pub table: String,
    pub version: String,
    pub files: Vec<String>,
    pub size: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ManifestContent {
    pub version: String,
    pub index: Vec<FilesMeta>,
    pub size: i64,
    /// Flattened `[start, end, ...]` token ranges the host replicates, per keyspace.
    pub token_ranges: HashMap<String, Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl ManifestContent {
    pub fn to_gzip(&self) -> Result<Vec<u8>, ManagerError> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&serde_json::to_vec(self)?)?;
        Ok(enc.finish()?)
    }

    pub fn from_gzip(data: &[u8]) -> Result<Self, ManagerError> {
        Ok(serde_json::from_reader(GzDecoder::new(data))?)
    }

    /// Remote sst paths (relative to the location root) the manifest references.
    pub fn sst_files(&self, cluster_id: Uuid, dc: &str, node_id: &str) -> Vec<String> {
        let mut files = Vec::new();
        for idx in &self.index {
            let dir = remote_sstable_version_dir(
                cluster_id,
                dc,
                node_id,
                &idx.keyspace,
                &idx.table,
                &idx.version,
            );
            for f in &idx.files {
                files.push(format!("{dir}/{f}"));
            }
        }
        files
    }
}

static MANIFEST_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^task_([0-9a-fA-F-]{36})_tag_(sm_[0-9]{8}T[0-9]{6}Z)\.manifest\.gz$").unwrap()
});

/// Parses a manifest file name into `(task_id, snapshot_tag)`.
pub fn parse_manifest_file_name(name: &str) -> Option<(Uuid, String)> {
    let m = MANIFEST_FILE_RE.captures(name)?;
    let task_id = Uuid::parse_str(&m[1]).ok()?;
    Some((task_id, m[2].to_string()))
}

impl Worker<'_> {
    /// Uploads the manager's schema dump, one object per distinct location,
    /// and marks it for inclusion in host manifests.
    pub(super) async fn upload_schema(&self) -> Result<(), ManagerError> {
        // The dump is the resolved keyspace/table layout of the run.
        let mut layout: BTreeMap<&str, &[String]> = BTreeMap::new();
        for u in &self.target.units {
            layout.insert(u.keyspace.as_str(), u.tables.as_slice());
        }
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&serde_json::to_vec(&layout)?)?;
        let body = Bytes::from(enc.finish()?);

        let path = remote_schema_file(self.cluster_id, self.task_id, &self.snapshot_tag);
        let mut uploaded: Vec<&str> = Vec::new();
        for h in &self.hosts {
            let loc = h.location.remote_path(&path);
            if uploaded.contains(&h.location.path.as_str()) {
                continue;
            }
            info!(host = %h.ip, path = %loc, "Uploading schema file");
            self.client.put(&h.ip, &loc, body.clone()).await?;
            uploaded.push(h.location.path.as_str());
        }

        self.schema_uploaded.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Uploads one gzipped manifest per host. Any failure cancels the stage
    /// and deletes the manifests already uploaded, on a detached context so
    /// the rollback survives cancellation.
    pub(super) async fn upload_manifests(&self) -> Result<(), ManagerError> {
        info!("Uploading manifest files...");

        let rollbacks: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());
        let failed = AtomicBool::new(false);

        let res = in_parallel_with_limits(&self.hosts, &self.target.upload_parallel, |h| {
            let rollbacks = &rollbacks;
            let failed = &failed;
            async move {
                if self.ctx.is_cancelled() || failed.load(Ordering::Relaxed) {
                    return Err(TaskError::Fail(ManagerError::Cancelled));
                }
                let m = self.aggregate_host_manifest(h);
                match self.upload_host_manifest(h, &m).await {
                    Ok(path) => {
                        rollbacks.lock().push((h.ip.clone(), path));
                        Ok(())
                    }
                    Err(e) => {
                        failed.store(true, Ordering::Relaxed);
                        error!(host = %h.ip, error = %e, "Uploading manifest file failed");
                        Err(abort(e))
                    }
                }
            }
        })
        .await;

        if let Err(e) = res {
            for (host, path) in rollbacks.into_inner().iter() {
                if let Err(re) = self.client.delete_remote_file(host, path).await {
                    error!(host = %host, path = %path, error = %re, "Cannot rollback manifest upload");
                }
            }
            error!("Uploading manifest files failed see exact errors above");
            return Err(e);
        }

        info!("Done uploading manifest files");
        Ok(())
    }

    fn aggregate_host_manifest(&self, h: &HostInfo) -> ManifestContent {
        let dirs = self
            .snapshot_dirs
            .lock()
            .get(&h.ip)
            .cloned()
            .unwrap_or_default();

        let mut token_ranges = HashMap::new();
        for u in &self.target.units {
            if let Some(ring) = self.rings.get(&u.keyspace) {
                token_ranges.insert(u.keyspace.clone(), ring.host_token_ranges(&h.ip));
            }
        }

        let mut content = ManifestContent {
            version: "v2".to_string(),
            index: Vec::with_capacity(dirs.len()),
            size: 0,
            token_ranges,
            schema: None,
        };
        for d in &dirs {
            content.index.push(FilesMeta {
                keyspace: d.keyspace.clone(),
                table: d.table.clone(),
                version: d.version.clone(),
                files: d.progress.files.clone(),
                size: d.progress.size,
            });
            content.size += d.progress.size;
        }
        if self.schema_uploaded.load(Ordering::Relaxed) {
            content.schema = Some(remote_schema_file(
                self.cluster_id,
                self.task_id,
                &self.snapshot_tag,
            ));
        }
        content
    }

    async fn upload_host_manifest(
        &self,
        h: &HostInfo,
        m: &ManifestContent,
    ) -> Result<String, ManagerError> {
        info!(host = %h.ip, "Uploading manifest file on host");

        let body = Bytes::from(m.to_gzip()?);
        let path = h.location.remote_path(&remote_manifest_file(
            self.cluster_id,
            self.task_id,
            &self.snapshot_tag,
            &h.dc,
            &h.id,
        ));
        self.client.put(&h.ip, &path, body).await?;

        info!(host = %h.ip, "Done uploading manifest file on host");
        Ok(path)
    }
}
