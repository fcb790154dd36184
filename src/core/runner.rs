// src/core/runner.rs

//! The seam between the external task scheduler and the orchestrators. The
//! scheduler resolves opaque task properties into a frozen target once, then
//! hands the target back for every (re)run it triggers.

use crate::core::errors::ManagerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a run. A run terminates exactly once, into DONE, STOPPED
/// (cancelled), or ERROR.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    #[strum(serialize = "NEW")]
    New,
    #[strum(serialize = "RUNNING")]
    Running,
    #[strum(serialize = "DONE")]
    Done,
    #[strum(serialize = "STOPPED")]
    Stopped,
    #[strum(serialize = "ERROR")]
    Error,
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    type Target: Send + Sync;

    /// Resolves task properties into a target. Read-only: may issue RPCs to
    /// resolve schema and ring but mutates nothing. Unknown property keys are
    /// ignored; malformed values fail with a validation error.
    async fn get_target(
        &self,
        cluster_id: Uuid,
        properties: &Value,
    ) -> Result<Self::Target, ManagerError>;

    /// Executes a run to completion, error, or cancellation. Cancellation is
    /// cooperative through `ctx` and ends the run with STOPPED status.
    async fn run(
        &self,
        ctx: &CancellationToken,
        cluster_id: Uuid,
        task_id: Uuid,
        run_id: Uuid,
        target: Self::Target,
    ) -> Result<(), ManagerError>;
}
