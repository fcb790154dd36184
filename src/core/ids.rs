// src/core/ids.rs

//! Identifier helpers. Entities that get listed chronologically (runs) use
//! time-ordered v7 UUIDs so that naturally ordered key scans yield
//! chronological order; plain entities (clusters) use random v4 UUIDs.

use uuid::Uuid;

pub fn new_cluster_id() -> Uuid {
    Uuid::new_v4()
}

pub fn new_run_id() -> Uuid {
    Uuid::now_v7()
}
