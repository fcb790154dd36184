// src/core/repair/plan.rs

//! Deterministic segmentation of a keyspace's token ring and its assignment
//! to hosts and shards. The plan is a pure function of the ring snapshot and
//! the target, so replanning an unchanged target yields identical segments.

use crate::core::client::{Ring, TokenRange};
use crate::core::errors::ManagerError;
use crate::core::repair::model::TokenRangesKind;
use std::collections::{BTreeMap, HashSet};

/// A half-open token interval `[start_token, end_token)` with a single,
/// well-defined replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start_token: i64,
    pub end_token: i64,
    pub replicas: Vec<String>,
}

/// Builds the segment list from a ring snapshot: token ranges ordered by
/// start token, adjacent ranges with identical replica sets combined.
pub fn build_segments(ring: &Ring) -> Result<Vec<Segment>, ManagerError> {
    if ring.tokens.is_empty() {
        return Err(ManagerError::Structural("malformed ring: no tokens".into()));
    }

    let mut ranges: Vec<&TokenRange> = ring.tokens.iter().collect();
    ranges.sort_by_key(|r| r.start_token);

    let mut segments: Vec<Segment> = Vec::with_capacity(ranges.len());
    for r in ranges {
        if r.replicas.is_empty() {
            return Err(ManagerError::Structural(format!(
                "malformed ring: range {}:{} has no replicas",
                r.start_token, r.end_token
            )));
        }
        if let Some(last) = segments.last_mut() {
            if last.end_token == r.start_token && last.replicas == r.replicas {
                last.end_token = r.end_token;
                continue;
            }
        }
        segments.push(Segment {
            start_token: r.start_token,
            end_token: r.end_token,
            replicas: r.replicas.clone(),
        });
    }
    Ok(segments)
}

/// Assigns segments to the hosts that will coordinate their repair, honoring
/// the token-range selection policy. Hosts iterate in address order.
pub fn assign_segments(
    segments: &[Segment],
    kind: TokenRangesKind,
    dcs: &[String],
    ring: &Ring,
) -> BTreeMap<String, Vec<Segment>> {
    let dc_set: HashSet<&str> = dcs.iter().map(String::as_str).collect();
    let in_dcs = |host: &str| {
        ring.host_dc
            .get(host)
            .map(|dc| dc_set.contains(dc.as_str()))
            .unwrap_or(false)
    };

    let mut assignments: BTreeMap<String, Vec<Segment>> = BTreeMap::new();
    for seg in segments {
        match kind {
            TokenRangesKind::Pr => {
                let primary = &seg.replicas[0];
                if in_dcs(primary) {
                    assignments.entry(primary.clone()).or_default().push(seg.clone());
                }
            }
            TokenRangesKind::Dcpr => {
                if let Some(primary) = seg.replicas.iter().find(|r| in_dcs(r)) {
                    assignments.entry(primary.clone()).or_default().push(seg.clone());
                }
            }
            TokenRangesKind::All => {
                for replica in seg.replicas.iter().filter(|r| in_dcs(r)) {
                    assignments
                        .entry(replica.clone())
                        .or_default()
                        .push(seg.clone());
                }
            }
        }
    }
    assignments
}

/// Maps a token to a shard with the node's biased token-to-shard function:
/// the unsigned token space divided into `shard_count` equal slices.
pub fn shard_of(token: i64, shard_count: u32) -> u32 {
    let t = token.wrapping_sub(i64::MIN) as u64;
    ((u128::from(t) * u128::from(shard_count)) >> 64) as u32
}

/// Splits a host's segments across its shards. Segment order within a shard
/// follows the input order, keeping batches deterministic.
pub fn split_to_shards(segments: Vec<Segment>, shard_count: u32) -> Vec<Vec<Segment>> {
    let mut shards: Vec<Vec<Segment>> = vec![Vec::new(); shard_count as usize];
    for seg in segments {
        let shard = shard_of(seg.start_token, shard_count) as usize;
        shards[shard].push(seg);
    }
    shards
}

/// Per-host execution plan of one unit.
#[derive(Debug, Clone)]
pub struct HostPlan {
    pub host: String,
    pub shard_count: u32,
    /// Segments per shard, indexed by shard number.
    pub shards: Vec<Vec<Segment>>,
}

#[derive(Debug, Clone)]
pub struct UnitPlan {
    pub keyspace: String,
    pub hosts: Vec<HostPlan>,
}

impl UnitPlan {
    pub fn segment_total(&self) -> usize {
        self.hosts
            .iter()
            .flat_map(|h| h.shards.iter())
            .map(Vec::len)
            .sum()
    }
}
