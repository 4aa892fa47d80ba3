use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "in_progress" => Some(RunStatus::InProgress),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }

    /// pending -> in_progress -> (success | failed), nothing else.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::InProgress)
                | (RunStatus::InProgress, RunStatus::Success)
                | (RunStatus::InProgress, RunStatus::Failed)
        )
    }
}

/// One execution attempt of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_backtrace: Option<String>,
}

impl FlowRun {
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .filter(|_| self.status.is_terminal())
            .map(|ended| ended - self.started_at)
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.duration()
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
    }
}

/// Terminal result written by `complete_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed {
        message: String,
        backtrace: Option<String>,
    },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Success => RunStatus::Success,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }
}

/// The open run record of one execution. Not `Clone`: `complete_run`
/// consumes it, so a run can only be completed once through its handle.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    flow_id: String,
    started_at: DateTime<Utc>,
}

impl RunHandle {
    pub(crate) fn new(run_id: String, flow_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            flow_id,
            started_at,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn short_id(&self) -> &str {
        let end = self.run_id.len().min(8);
        &self.run_id[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_run(ended_after: Option<Duration>) -> FlowRun {
        let started_at = Utc::now();
        FlowRun {
            id: "r1".to_string(),
            flow_id: "f1".to_string(),
            status: if ended_after.is_some() {
                RunStatus::Success
            } else {
                RunStatus::InProgress
            },
            started_at,
            ended_at: ended_after.map(|d| started_at + d),
            error_message: None,
            error_backtrace: None,
        }
    }

    #[test]
    fn test_duration_absent_while_open() {
        let run = test_run(None);
        assert!(run.duration().is_none());
        assert!(run.duration_secs().is_none());
    }

    #[test]
    fn test_duration_after_completion() {
        let run = test_run(Some(Duration::seconds(5)));
        let secs = run.duration_secs().unwrap();
        assert!((secs - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_transitions() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Success));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Success));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(Pending));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RunStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        for status in [
            RunStatus::Pending,
            RunStatus::InProgress,
            RunStatus::Success,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_short_id_truncates() {
        let handle = RunHandle::new(
            "0123456789abcdef".to_string(),
            "f1".to_string(),
            Utc::now(),
        );
        assert_eq!(handle.short_id(), "01234567");
    }
}
