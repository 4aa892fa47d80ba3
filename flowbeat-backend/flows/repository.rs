use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StoreError;
use super::history::{FlowRun, RunHandle, RunOutcome};
use super::{Flow, FlowUpdate, LastRunStatus, NewFlow};

#[async_trait]
pub trait FlowRepository: Send + Sync {
    // Flows
    async fn create_flow(&self, new_flow: NewFlow) -> Result<Flow, StoreError>;
    async fn get_flow(&self, id: &str) -> Result<Option<Flow>, StoreError>;
    async fn get_flow_by_name(&self, name: &str) -> Result<Option<Flow>, StoreError>;
    async fn list_flows(&self) -> Result<Vec<Flow>, StoreError>;
    async fn update_flow(&self, id: &str, update: FlowUpdate) -> Result<Flow, StoreError>;
    async fn delete_flow(&self, id: &str) -> Result<bool, StoreError>;

    // Scheduling

    /// Return every enabled flow due at `now` and mark it claimed, skipping
    /// flows already claimed by a concurrent caller.
    async fn claim_due_flows(&self, now: DateTime<Utc>) -> Result<Vec<Flow>, StoreError>;

    /// Push an existing claim's expiry to `now` plus the claim TTL. Returns
    /// false when the flow is not currently claimed.
    async fn extend_claim(&self, flow_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Write `last_run_at`/`last_run_status` and release the claim.
    async fn record_outcome(
        &self,
        flow_id: &str,
        status: LastRunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Runs

    /// Create a run record (pending) and move it to in_progress.
    async fn open_run(
        &self,
        flow_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<RunHandle, StoreError>;

    /// Write the terminal status. Fails with `InvalidTransition` when the
    /// record is already terminal.
    async fn complete_run(
        &self,
        handle: RunHandle,
        outcome: RunOutcome,
        ended_at: DateTime<Utc>,
    ) -> Result<FlowRun, StoreError>;

    /// Newest first.
    async fn list_runs(&self, flow_id: &str, limit: usize) -> Result<Vec<FlowRun>, StoreError>;
    async fn get_run(&self, id: &str) -> Result<Option<FlowRun>, StoreError>;
}
