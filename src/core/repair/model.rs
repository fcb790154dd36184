// src/core/repair/model.rs

//! Repair run records, targets, and per-shard progress rows.

use crate::core::ksfilter::Unit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::core::runner::RunStatus;

pub const RUN_TABLE: &str = "repair_run";
pub const PROGRESS_TABLE: &str = "repair_run_progress";

/// Which token ranges of a keyspace a host repairs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenRangesKind {
    /// Ranges whose primary replica within the selected datacenters is the host.
    #[default]
    Dcpr,
    /// Ranges whose first replica is the host, any datacenter.
    Pr,
    /// Every range the host replicates, replicas intersected with the
    /// selected datacenters.
    All,
}

/// The scheduler-provided properties blob.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TaskProperties {
    #[serde(default)]
    pub keyspace: Vec<String>,
    #[serde(default)]
    pub dc: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub token_ranges: TokenRangesKind,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(rename = "continue", default = "default_true")]
    pub continue_: bool,
    #[serde(default)]
    pub segments_per_repair: Option<usize>,
    #[serde(default)]
    pub shard_parallel_max: Option<usize>,
}

fn default_true() -> bool {
    true
}

/// The frozen planning inputs of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Target {
    pub units: Vec<Unit>,
    pub dc: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub token_ranges: TokenRangesKind,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(rename = "continue")]
    pub continue_: bool,
    pub segments_per_repair: usize,
    /// Upper bound on concurrently repaired shards of a host;
    /// `0` means the node's shard count.
    pub shard_parallel_max: usize,
}

impl Target {
    /// True when both targets select the same data. Execution knobs like
    /// `fail_fast` do not affect scope.
    pub fn same_scope(&self, other: &Target) -> bool {
        self.units == other.units
            && self.dc == other.dc
            && self.host == other.host
            && self.token_ranges == other.token_ranges
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Run {
    pub cluster_id: Uuid,
    pub task_id: Uuid,
    pub id: Uuid,
    #[serde(default)]
    pub prev_id: Option<Uuid>,
    pub target: Target,
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

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    Pending,
    Running,
    Success,
    Error,
}

/// Per-(run, unit, host, shard) progress row. Segment states are indexed by
/// the shard's deterministic segment order, so a resumed run with an
/// identical target maps states onto the same segments.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShardProgress {
    pub cluster_id: Uuid,
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub unit: usize,
    pub host: String,
    pub shard: u32,

    pub segment_count: usize,
    pub segment_success: usize,
    pub segment_error: usize,
    pub states: Vec<SegmentState>,
}

impl ShardProgress {
    pub fn key(&self) -> String {
        progress_key(
            self.cluster_id,
            self.task_id,
            self.run_id,
            self.unit,
            &self.host,
            self.shard,
        )
    }

    /// Recomputes the counters from the segment states.
    pub fn sync_counters(&mut self) {
        self.segment_count = self.states.len();
        self.segment_success = self
            .states
            .iter()
            .filter(|s| **s == SegmentState::Success)
            .count();
        self.segment_error = self
            .states
            .iter()
            .filter(|s| **s == SegmentState::Error)
            .count();
    }
}

pub fn progress_key(
    cluster_id: Uuid,
    task_id: Uuid,
    run_id: Uuid,
    unit: usize,
    host: &str,
    shard: u32,
) -> String {
    format!("{cluster_id}/{task_id}/{run_id}/{unit}/{host}/{shard}")
}

pub fn progress_prefix(cluster_id: Uuid, task_id: Uuid, run_id: Uuid) -> String {
    format!("{cluster_id}/{task_id}/{run_id}/")
}

// --- Read-side progress rollups ---

#[derive(Serialize, Debug, Clone)]
pub struct ShardView {
    pub shard: u32,
    pub segment_count: usize,
    pub segment_success: usize,
    pub segment_error: usize,
    pub percent_complete: u8,
    pub percent_failed: u8,
}

#[derive(Serialize, Debug, Clone)]
pub struct NodeProgress {
    pub host: String,
    pub percent_complete: u8,
    pub percent_failed: u8,
    pub shards: Vec<ShardView>,
}

#[derive(Serialize, Debug, Clone)]
pub struct UnitProgress {
    pub keyspace: String,
    pub percent_complete: u8,
    pub percent_failed: u8,
    pub nodes: Vec<NodeProgress>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Progress {
    pub units: Vec<UnitProgress>,
    pub percent_complete: u8,
    pub percent_failed: u8,
}

pub fn percent(part: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (part * 100 / total) as u8
}
