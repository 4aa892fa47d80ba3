use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::ready;
use serde::Serialize;

use super::Flow;
use super::coordinator::ExecutionCoordinator;
use super::error::StoreError;
use super::repository::FlowRepository;

/// Result of one heartbeat cycle.
///
/// `flows_triggered` counts executions that returned without error, so a
/// flow that ran and failed counts toward `flows_due` only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub flows_due: usize,
    pub flows_triggered: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct HeartbeatDispatcher {
    repo: Arc<dyn FlowRepository>,
    coordinator: Arc<ExecutionCoordinator>,
    max_concurrency: usize,
}

impl HeartbeatDispatcher {
    pub fn new(repo: Arc<dyn FlowRepository>, coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self {
            repo,
            coordinator,
            max_concurrency: 1,
        }
    }

    /// Execute up to `n` claimed flows at once. Values below 1 are treated as 1.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Claim due flows and execute each. Only a failed claim fails the cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        let flows = self.repo.claim_due_flows(now).await.inspect_err(|e| {
            tracing::error!(error = %e, "Failed to claim due flows");
        })?;

        let flows_due = flows.len();
        if flows_due == 0 {
            tracing::debug!("No flows due");
            return Ok(CycleReport {
                flows_due,
                flows_triggered: 0,
                timestamp: now,
            });
        }

        tracing::info!(flows_due, "Heartbeat claimed due flows");

        let flows_triggered = futures::stream::iter(
            flows
                .into_iter()
                .map(|flow| async move { self.dispatch(&flow).await }),
        )
        .buffer_unordered(self.max_concurrency)
        .filter(|completed| ready(*completed))
        .count()
        .await;

        tracing::info!(flows_due, flows_triggered, "Heartbeat cycle finished");

        Ok(CycleReport {
            flows_due,
            flows_triggered,
            timestamp: now,
        })
    }

    async fn dispatch(&self, flow: &Flow) -> bool {
        match self.coordinator.execute(flow).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(flow = %flow.name, flow_id = %flow.id, error = %e, "Flow execution failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::coordinator::tests::SteppingClock;
    use crate::flows::history::{FlowRun, RunHandle, RunOutcome, RunStatus};
    use crate::flows::runner::FlowRunner;
    use crate::flows::runner::tests::test_registry;
    use crate::flows::sqlite_repository::SqliteFlowRepository;
    use crate::flows::{FlowUpdate, LastRunStatus, NewFlow};
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        repo: Arc<SqliteFlowRepository>,
        runs: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                repo: Arc::new(SqliteFlowRepository::open_in_memory(Duration::minutes(15)).unwrap()),
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn dispatcher_over(&self, repo: Arc<dyn FlowRepository>) -> HeartbeatDispatcher {
            let runner = FlowRunner::new(Arc::new(test_registry(self.runs.clone())));
            let clock = Arc::new(SteppingClock::new(Utc::now(), Duration::milliseconds(10)));
            let coordinator = Arc::new(ExecutionCoordinator::with_clock(self.repo.clone(), runner, clock));
            HeartbeatDispatcher::new(repo, coordinator)
        }

        fn dispatcher(&self) -> HeartbeatDispatcher {
            self.dispatcher_over(self.repo.clone())
        }

        async fn create(&self, name: &str, interval: i64, unit: &str) -> Flow {
            self.repo
                .create_flow(NewFlow::new(name, interval, json!({ "class_name": unit })))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_cycle_contains_single_failure() {
        let fx = Fixture::new();
        let ok_a = fx.create("a", 60, "Recording").await;
        let bad = fx.create("b", 60, "Failing").await;
        let ok_c = fx.create("c", 60, "Recording").await;

        let report = fx.dispatcher().run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.flows_due, 3);
        assert_eq!(report.flows_triggered, 2);
        assert_eq!(fx.runs.load(Ordering::SeqCst), 2);

        for flow in [&ok_a, &bad, &ok_c] {
            let runs = fx.repo.list_runs(&flow.id, 10).await.unwrap();
            assert_eq!(runs.len(), 1);
            assert!(runs[0].status.is_terminal());
        }
        let bad = fx.repo.get_flow(&bad.id).await.unwrap().unwrap();
        assert_eq!(bad.last_run_status, Some(LastRunStatus::Failed));
    }

    #[tokio::test]
    async fn test_cycle_with_nothing_due() {
        let fx = Fixture::new();
        let flow = fx.create("a", 3600, "Recording").await;
        fx.repo
            .update_flow(
                &flow.id,
                FlowUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let now = Utc::now();
        let report = fx.dispatcher().run_cycle(now).await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                flows_due: 0,
                flows_triggered: 0,
                timestamp: now,
            }
        );
        assert!(fx.repo.list_runs(&flow.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_cycle_skips_recently_run_flows() {
        let fx = Fixture::new();
        fx.create("a", 60, "Recording").await;
        let dispatcher = fx.dispatcher();

        let now = Utc::now();
        assert_eq!(dispatcher.run_cycle(now).await.unwrap().flows_due, 1);
        assert_eq!(dispatcher.run_cycle(now + Duration::seconds(1)).await.unwrap().flows_due, 0);
        assert_eq!(dispatcher.run_cycle(now + Duration::seconds(120)).await.unwrap().flows_due, 1);
    }

    #[tokio::test]
    async fn test_parallel_cycle_counts_match_sequential() {
        let fx = Fixture::new();
        for i in 0..6 {
            let unit = if i % 3 == 0 { "Failing" } else { "Recording" };
            fx.create(&format!("flow-{i}"), 60, unit).await;
        }

        let report = fx
            .dispatcher()
            .with_max_concurrency(4)
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.flows_due, 6);
        assert_eq!(report.flows_triggered, 4);
    }

    /// Delegates everything except the claim, which fails.
    struct BrokenClaims(Arc<SqliteFlowRepository>);

    #[async_trait]
    impl FlowRepository for BrokenClaims {
        async fn create_flow(&self, new_flow: NewFlow) -> Result<Flow, StoreError> {
            self.0.create_flow(new_flow).await
        }
        async fn get_flow(&self, id: &str) -> Result<Option<Flow>, StoreError> {
            self.0.get_flow(id).await
        }
        async fn get_flow_by_name(&self, name: &str) -> Result<Option<Flow>, StoreError> {
            self.0.get_flow_by_name(name).await
        }
        async fn list_flows(&self) -> Result<Vec<Flow>, StoreError> {
            self.0.list_flows().await
        }
        async fn update_flow(&self, id: &str, update: FlowUpdate) -> Result<Flow, StoreError> {
            self.0.update_flow(id, update).await
        }
        async fn delete_flow(&self, id: &str) -> Result<bool, StoreError> {
            self.0.delete_flow(id).await
        }
        async fn claim_due_flows(&self, _now: DateTime<Utc>) -> Result<Vec<Flow>, StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "database unreachable",
            )))
        }
        async fn extend_claim(&self, flow_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
            self.0.extend_claim(flow_id, now).await
        }
        async fn record_outcome(
            &self,
            flow_id: &str,
            status: LastRunStatus,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.0.record_outcome(flow_id, status, at).await
        }
        async fn open_run(
            &self,
            flow_id: &str,
            started_at: DateTime<Utc>,
        ) -> Result<RunHandle, StoreError> {
            self.0.open_run(flow_id, started_at).await
        }
        async fn complete_run(
            &self,
            handle: RunHandle,
            outcome: RunOutcome,
            ended_at: DateTime<Utc>,
        ) -> Result<FlowRun, StoreError> {
            self.0.complete_run(handle, outcome, ended_at).await
        }
        async fn list_runs(&self, flow_id: &str, limit: usize) -> Result<Vec<FlowRun>, StoreError> {
            self.0.list_runs(flow_id, limit).await
        }
        async fn get_run(&self, id: &str) -> Result<Option<FlowRun>, StoreError> {
            self.0.get_run(id).await
        }
    }

    #[tokio::test]
    async fn test_claim_failure_is_fatal_and_runs_nothing() {
        let fx = Fixture::new();
        let flow = fx.create("a", 60, "Recording").await;
        let dispatcher = fx.dispatcher_over(Arc::new(BrokenClaims(fx.repo.clone())));

        let err = dispatcher.run_cycle(Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("database unreachable"));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
        assert!(fx.repo.list_runs(&flow.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_runs_on_spawned_task() {
        let fx = Fixture::new();
        fx.create("a", 60, "Recording").await;
        fx.create("b", 60, "Recording").await;
        let dispatcher = Arc::new(fx.dispatcher().with_max_concurrency(2));

        let report = tokio::spawn(async move { dispatcher.run_cycle(Utc::now()).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.flows_triggered, 2);
    }

    #[tokio::test]
    async fn test_report_serializes_rfc3339_timestamp() {
        let now = DateTime::parse_from_rfc3339("2024-11-12T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let report = CycleReport {
            flows_due: 3,
            flows_triggered: 2,
            timestamp: now,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["flows_due"], 3);
        assert_eq!(value["flows_triggered"], 2);
        assert_eq!(value["timestamp"], "2024-11-12T10:00:00Z");
    }

    #[tokio::test]
    async fn test_run_records_left_terminal_after_cycle() {
        let fx = Fixture::new();
        let flow = fx.create("a", 60, "Failing").await;
        fx.dispatcher().run_cycle(Utc::now()).await.unwrap();
        let runs = fx.repo.list_runs(&flow.id, 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].error_message.is_some());
    }
}
