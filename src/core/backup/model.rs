// src/core/backup/model.rs

//! Backup run records, targets, locations, snapshot tags, and the remote
//! object-storage layout.

use crate::core::errors::ManagerError;
use crate::core::ksfilter::Unit;
use crate::core::runner::RunStatus;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;
use uuid::Uuid;

pub const RUN_TABLE: &str = "backup_run";
pub const PROGRESS_TABLE: &str = "backup_run_progress";

/// Node-local rclone-style remote pointing at the database data directory.
pub const DATA_DIR: &str = "data:";

pub fn keyspace_dir(keyspace: &str) -> String {
    format!("{DATA_DIR}{keyspace}")
}

// --- Provider & location ---

/// Remote storage provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    #[default]
    S3,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::S3 => "s3",
        }
    }
}

impl FromStr for Provider {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(Provider::S3),
            _ => Err(ManagerError::Validation(format!(
                "unrecognised provider {s:?}"
            ))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    // Providers require DNS compliant resource names.
    Regex::new(r"^(?:([a-zA-Z0-9\-\._]+):)?([a-z0-9]+):([a-z0-9\-\.]+)$").unwrap()
});

/// Storage provider and container for a datacenter. The string form is
/// `[<dc>:]<provider>:<path>`, e.g. `s3:my-bucket` or `dc1:s3:my-bucket`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location {
    pub dc: String,
    pub provider: Provider,
    pub path: String,
}

impl Location {
    /// A path under this location in the form the agent's remote filesystem
    /// understands, e.g. `s3:my-bucket/backup/...`.
    pub fn remote_path(&self, p: &str) -> String {
        if p.is_empty() {
            format!("{}:{}", self.provider, self.path)
        } else {
            format!("{}:{}/{}", self.provider, self.path, p.trim_start_matches('/'))
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dc.is_empty() {
            write!(f, "{}:{}", self.provider, self.path)
        } else {
            write!(f, "{}:{}:{}", self.dc, self.provider, self.path)
        }
    }
}

impl FromStr for Location {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let m = LOCATION_RE.captures(s).ok_or_else(|| {
            ManagerError::Validation(format!(
                "invalid location {s:?}, the format is [dc:]<provider>:<path> \
                 ex. s3:my-bucket, the path must be DNS compliant"
            ))
        })?;
        Ok(Location {
            dc: m.get(1).map(|g| g.as_str().to_string()).unwrap_or_default(),
            provider: m[2].parse()?,
            path: m[3].to_string(),
        })
    }
}

impl TryFrom<String> for Location {
    type Error = ManagerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Location> for String {
    fn from(l: Location) -> Self {
        l.to_string()
    }
}

static DC_LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:([a-zA-Z0-9\-\._]+):)?([0-9]+)$").unwrap());

/// A per-datacenter numeric limit: MiB/s for bandwidth, host count for stage
/// parallelism. The string form is `[<dc>:]<number>`; an empty dc is the
/// default for unlisted datacenters, `0` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DCLimit {
    pub dc: String,
    pub limit: u32,
}

impl fmt::Display for DCLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dc.is_empty() {
            write!(f, "{}", self.limit)
        } else {
            write!(f, "{}:{}", self.dc, self.limit)
        }
    }
}

impl FromStr for DCLimit {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let m = DC_LIMIT_RE.captures(s).ok_or_else(|| {
            ManagerError::Validation(format!(
                "invalid limit {s:?}, the format is [dc:]<number>"
            ))
        })?;
        Ok(DCLimit {
            dc: m.get(1).map(|g| g.as_str().to_string()).unwrap_or_default(),
            limit: m[2]
                .parse()
                .map_err(|e| ManagerError::Validation(format!("invalid limit value: {e}")))?,
        })
    }
}

impl TryFrom<String> for DCLimit {
    type Error = ManagerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DCLimit> for String {
    fn from(l: DCLimit) -> Self {
        l.to_string()
    }
}

/// Keeps only entries that target one of `dcs` or are untagged defaults.
pub fn filter_dc_limits(limits: &[DCLimit], dcs: &[String]) -> Vec<DCLimit> {
    limits
        .iter()
        .filter(|l| l.dc.is_empty() || dcs.contains(&l.dc))
        .cloned()
        .collect()
}

pub fn filter_dc_locations(locations: &[Location], dcs: &[String]) -> Vec<Location> {
    locations
        .iter()
        .filter(|l| l.dc.is_empty() || dcs.contains(&l.dc))
        .cloned()
        .collect()
}

// --- Snapshot tags ---

const TAG_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sm_[0-9]{8}T[0-9]{6}Z$").unwrap());

/// Mints a snapshot tag for the current instant. Tags order
/// lexicographically in chronological order.
pub fn new_snapshot_tag() -> String {
    snapshot_tag_at(Utc::now())
}

pub fn snapshot_tag_at(t: DateTime<Utc>) -> String {
    format!("sm_{}", t.format(TAG_TIME_FORMAT))
}

pub fn is_snapshot_tag(s: &str) -> bool {
    TAG_RE.is_match(s)
}

pub fn snapshot_tag_time(tag: &str) -> Result<DateTime<Utc>, ManagerError> {
    if !is_snapshot_tag(tag) {
        return Err(ManagerError::Validation(format!(
            "invalid snapshot tag {tag:?}"
        )));
    }
    let naive = NaiveDateTime::parse_from_str(&tag[3..], TAG_TIME_FORMAT)
        .map_err(|e| ManagerError::Validation(format!("invalid snapshot tag {tag:?}: {e}")))?;
    Ok(naive.and_utc())
}

// --- Remote layout ---

pub fn remote_meta_cluster_dc_dir(cluster_id: Uuid) -> String {
    format!("backup/meta/cluster/{cluster_id}/dc")
}

pub fn remote_manifest_dir(cluster_id: Uuid, dc: &str, node_id: &str) -> String {
    format!("{}/{dc}/node/{node_id}", remote_meta_cluster_dc_dir(cluster_id))
}

pub fn remote_manifest_file(
    cluster_id: Uuid,
    task_id: Uuid,
    snapshot_tag: &str,
    dc: &str,
    node_id: &str,
) -> String {
    format!(
        "{}/task_{task_id}_tag_{snapshot_tag}.manifest.gz",
        remote_manifest_dir(cluster_id, dc, node_id)
    )
}

pub fn remote_sstable_version_dir(
    cluster_id: Uuid,
    dc: &str,
    node_id: &str,
    keyspace: &str,
    table: &str,
    version: &str,
) -> String {
    format!(
        "backup/sst/cluster/{cluster_id}/dc/{dc}/node/{node_id}/keyspace/{keyspace}/table/{table}/{version}"
    )
}

pub fn remote_schema_file(cluster_id: Uuid, task_id: Uuid, snapshot_tag: &str) -> String {
    format!("backup/schema/cluster/{cluster_id}/task_{task_id}_tag_{snapshot_tag}.schema.json.gz")
}

// --- Properties, target, run ---

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TaskProperties {
    #[serde(default)]
    pub keyspace: Vec<String>,
    #[serde(default)]
    pub dc: Vec<String>,
    #[serde(default)]
    pub location: Vec<Location>,
    #[serde(default = "default_retention")]
    pub retention: usize,
    #[serde(default)]
    pub rate_limit: Vec<DCLimit>,
    #[serde(default)]
    pub snapshot_parallel: Vec<DCLimit>,
    #[serde(default)]
    pub upload_parallel: Vec<DCLimit>,
    #[serde(rename = "continue", default = "default_true")]
    pub continue_: bool,
}

fn default_retention() -> usize {
    3
}
fn default_true() -> bool {
    true
}

/// What to back up and where.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Target {
    pub units: Vec<Unit>,
    pub dc: Vec<String>,
    pub location: Vec<Location>,
    pub retention: usize,
    #[serde(default)]
    pub rate_limit: Vec<DCLimit>,
    #[serde(default)]
    pub snapshot_parallel: Vec<DCLimit>,
    #[serde(default)]
    pub upload_parallel: Vec<DCLimit>,
    #[serde(rename = "continue")]
    pub continue_: bool,
}

impl Target {
    /// True when both targets back up the same data to the same place.
    pub fn same_scope(&self, other: &Target) -> bool {
        self.units == other.units && self.dc == other.dc && self.location == other.location
    }
}

/// Pipeline stage, persisted for observability.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    #[strum(serialize = "INIT")]
    Init,
    #[strum(serialize = "SNAPSHOT")]
    Snapshot,
    #[strum(serialize = "INDEX")]
    Index,
    #[strum(serialize = "SCHEMA")]
    Schema,
    #[strum(serialize = "MANIFEST")]
    Manifest,
    #[strum(serialize = "UPLOAD")]
    Upload,
    #[strum(serialize = "PURGE")]
    Purge,
    #[strum(serialize = "DONE")]
    Done,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Run {
    pub cluster_id: Uuid,
    pub task_id: Uuid,
    pub id: Uuid,
    #[serde(default)]
    pub prev_id: Option<Uuid>,
    pub snapshot_tag: String,
    pub target: Target,
    pub stage: Stage,
    pub status: RunStatus,
    #[serde(default)]
    pub cause: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub done_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn key(&self) -> String {
        run_key(self.cluster_id, self.task_id, self.id)
    }
}

pub fn run_key(cluster_id: Uuid, task_id: Uuid, run_id: Uuid) -> String {
    format!("{cluster_id}/{task_id}/{run_id}")
}

// --- Host plan & progress ---

/// One target host with its resolved location and bandwidth cap.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub dc: String,
    pub ip: String,
    pub id: String,
    pub location: Location,
    pub rate_limit: DCLimit,
}

/// Upload progress of one table's snapshot files on one host. `failed` counts
/// bytes that were uploaded but must be re-uploaded after an error; resume
/// granularity is the whole file.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RunProgress {
    pub cluster_id: Uuid,
    pub task_id: Uuid,
    pub run_id: Uuid,
    #[serde(default)]
    pub agent_job_id: i64,

    pub host: String,
    pub unit: usize,
    pub table_name: String,

    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: String,
    pub size: i64,
    #[serde(default)]
    pub uploaded: i64,
    #[serde(default)]
    pub skipped: i64,
    #[serde(default)]
    pub failed: i64,
}

impl RunProgress {
    pub fn key(&self) -> String {
        progress_key(
            self.cluster_id,
            self.task_id,
            self.run_id,
            &self.host,
            self.unit,
            &self.table_name,
        )
    }
}

pub fn progress_key(
    cluster_id: Uuid,
    task_id: Uuid,
    run_id: Uuid,
    host: &str,
    unit: usize,
    table: &str,
) -> String {
    format!("{cluster_id}/{task_id}/{run_id}/{host}/{unit}/{table}")
}

pub fn progress_prefix(cluster_id: Uuid, task_id: Uuid, run_id: Uuid) -> String {
    format!("{cluster_id}/{task_id}/{run_id}/")
}

/// A versioned table snapshot directory discovered on a host.
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    pub host: String,
    pub unit: usize,
    pub path: String,
    pub keyspace: String,
    pub table: String,
    pub version: String,
    pub progress: RunProgress,
}

// --- Read-side progress rollups ---

#[derive(Serialize, Debug, Clone, Default)]
pub struct ProgressTotals {
    pub size: i64,
    pub uploaded: i64,
    pub skipped: i64,
    pub failed: i64,
}

impl ProgressTotals {
    pub fn add(&mut self, p: &RunProgress) {
        self.size += p.size;
        self.uploaded += p.uploaded;
        self.skipped += p.skipped;
        self.failed += p.failed;
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct TableProgress {
    pub table: String,
    #[serde(flatten)]
    pub totals: ProgressTotals,
    #[serde(default)]
    pub error: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct KeyspaceProgress {
    pub keyspace: String,
    #[serde(flatten)]
    pub totals: ProgressTotals,
    pub tables: Vec<TableProgress>,
}

#[derive(Serialize, Debug, Clone)]
pub struct HostProgress {
    pub host: String,
    #[serde(flatten)]
    pub totals: ProgressTotals,
    pub keyspaces: Vec<KeyspaceProgress>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Progress {
    pub snapshot_tag: String,
    pub dc: Vec<String>,
    #[serde(flatten)]
    pub totals: ProgressTotals,
    pub hosts: Vec<HostProgress>,
}
