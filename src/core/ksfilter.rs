// src/core/ksfilter.rs

//! Keyspace/table selection by glob patterns. Patterns take the form
//! `keyspace` or `keyspace.table`, with `*`/`?` wildcards; a leading `!`
//! turns a pattern into an exclusion. An empty pattern list selects
//! everything except system keyspaces.

use crate::core::errors::ManagerError;
use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

const SYSTEM_PREFIX: &str = "system";

/// A keyspace and the tables targeted within it. An empty table list with
/// `all_tables` set means the whole keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub keyspace: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub all_tables: bool,
}

struct Pattern {
    keyspace: WildMatch,
    table: Option<WildMatch>,
}

impl Pattern {
    fn matches(&self, keyspace: &str, table: &str) -> bool {
        if !self.keyspace.matches(keyspace) {
            return false;
        }
        match &self.table {
            Some(t) => t.matches(table),
            None => true,
        }
    }
}

/// Compiled include/exclude filter over `(keyspace, table)` pairs.
pub struct KeyspaceFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl KeyspaceFilter {
    pub fn new(filters: &[String]) -> Result<Self, ManagerError> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();

        for f in filters {
            let (neg, body) = match f.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, f.as_str()),
            };
            if body.is_empty() {
                return Err(ManagerError::Validation(format!(
                    "invalid filter {f:?}: empty pattern"
                )));
            }
            let mut parts = body.splitn(2, '.');
            let ks = parts.next().unwrap_or_default();
            if ks.is_empty() {
                return Err(ManagerError::Validation(format!(
                    "invalid filter {f:?}: missing keyspace"
                )));
            }
            let p = Pattern {
                keyspace: WildMatch::new(ks),
                table: parts.next().map(WildMatch::new),
            };
            if neg {
                exclude.push(p);
            } else {
                include.push(p);
            }
        }

        Ok(Self { include, exclude })
    }

    fn matches(&self, keyspace: &str, table: &str) -> bool {
        if self.include.is_empty() {
            // Default selection skips system keyspaces.
            if keyspace.starts_with(SYSTEM_PREFIX) {
                return false;
            }
        } else if !self.include.iter().any(|p| p.matches(keyspace, table)) {
            return false;
        }
        !self.exclude.iter().any(|p| p.matches(keyspace, table))
    }

    /// Applies the filter to a resolved schema, keeping the schema's keyspace
    /// and table order. A unit that keeps every table of its keyspace is
    /// flagged `all_tables`.
    pub fn apply(&self, schema: &[(String, Vec<String>)]) -> Vec<Unit> {
        let mut units = Vec::new();
        for (keyspace, tables) in schema {
            let kept: Vec<String> = tables
                .iter()
                .filter(|t| self.matches(keyspace, t))
                .cloned()
                .collect();
            if kept.is_empty() {
                continue;
            }
            let all = kept.len() == tables.len();
            units.push(Unit {
                keyspace: keyspace.clone(),
                tables: if all { Vec::new() } else { kept },
                all_tables: all,
            });
        }
        units
    }
}
