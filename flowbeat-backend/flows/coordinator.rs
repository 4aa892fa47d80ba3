use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use super::error::StoreError;
use super::history::{FlowRun, RunOutcome};
use super::repository::FlowRepository;
use super::runner::{ExecutionFailure, FlowRunner};
use super::{Flow, LastRunStatus};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The work failed. Flow summary and run record are already persisted.
    #[error("flow execution failed: {0}")]
    Failed(ExecutionFailure),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Claims held by a running flow are renewed at this period by default.
pub const DEFAULT_CLAIM_RENEWAL: Duration = Duration::from_secs(300);

/// Drives one flow execution: open run record, invoke the work unit, write
/// the terminal state to both the flow and the run record.
pub struct ExecutionCoordinator {
    repo: Arc<dyn FlowRepository>,
    runner: FlowRunner,
    clock: Arc<dyn Clock>,
    claim_renewal: Duration,
}

impl ExecutionCoordinator {
    pub fn new(repo: Arc<dyn FlowRepository>, runner: FlowRunner) -> Self {
        Self::with_clock(repo, runner, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repo: Arc<dyn FlowRepository>,
        runner: FlowRunner,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            runner,
            clock,
            claim_renewal: DEFAULT_CLAIM_RENEWAL,
        }
    }

    /// Renew the flow's claim at this period while its work runs. Must be
    /// shorter than the store's claim TTL.
    pub fn with_claim_renewal(mut self, every: Duration) -> Self {
        self.claim_renewal = every.max(Duration::from_millis(1));
        self
    }

    pub async fn execute(&self, flow: &Flow) -> Result<FlowRun, ExecuteError> {
        let handle = self.repo.open_run(&flow.id, self.clock.now()).await?;

        let span = tracing::info_span!("flow_run", flow = %flow.name, run = %handle.short_id());
        tracing::info!(parent: &span, interval = flow.run_interval, "▶ Started");

        let result = self.run_holding_claim(flow).instrument(span.clone()).await;
        let ended_at = self.clock.now();

        let (status, outcome) = match &result {
            Ok(()) => (LastRunStatus::Success, RunOutcome::Success),
            Err(failure) => (
                LastRunStatus::Failed,
                RunOutcome::Failed {
                    message: failure.message.clone(),
                    backtrace: failure.backtrace.clone(),
                },
            ),
        };

        // The run record is completed even when the summary write fails, so
        // no execution is left open.
        let summary = self.repo.record_outcome(&flow.id, status, ended_at).await;
        if let Err(e) = &summary {
            tracing::error!(parent: &span, error = %e, "Failed to record flow outcome");
        }
        let completed = self.repo.complete_run(handle, outcome, ended_at).await;
        summary?;
        let run = completed?;

        let elapsed = format!("{:.1}s", run.duration_secs().unwrap_or_default());
        match result {
            Ok(()) => {
                tracing::info!(parent: &span, elapsed = %elapsed, "✓ Completed");
                Ok(run)
            }
            Err(failure) => {
                tracing::error!(parent: &span, elapsed = %elapsed, error = %failure.message, "✗ Failed");
                Err(ExecuteError::Failed(failure))
            }
        }
    }

    /// Run the work unit, renewing the flow's claim until it returns.
    async fn run_holding_claim(&self, flow: &Flow) -> Result<(), ExecutionFailure> {
        let work = self.runner.run(&flow.configuration);
        tokio::pin!(work);

        let mut renewal = tokio::time::interval(self.claim_renewal);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renewal.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = renewal.tick() => {
                    if let Err(e) = self.repo.extend_claim(&flow.id, self.clock.now()).await {
                        tracing::warn!(error = %e, "Failed to renew flow claim");
                    }
                }
            }
        }
    }
}
