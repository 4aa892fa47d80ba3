pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod repository;
pub mod runner;
pub mod sqlite_repository;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use self::error::StoreError;
use self::runner::work_unit_name;

/// A named unit of recurring work, due every `run_interval` seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between runs. Always positive.
    pub run_interval: i64,
    /// Opaque to everything except the flow runner.
    pub configuration: Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<LastRunStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRunStatus {
    Success,
    Failed,
}

impl LastRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastRunStatus::Success => "success",
            LastRunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(LastRunStatus::Success),
            "failed" => Some(LastRunStatus::Failed),
            _ => None,
        }
    }
}

impl Flow {
    /// `None` when the interval is too large to represent.
    pub fn interval(&self) -> Option<Duration> {
        Duration::try_seconds(self.run_interval)
    }

    /// Enabled, and either never run or at least one interval since the last run.
    /// A flow whose interval overflows is never due again after its first run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_run_at {
            None => true,
            Some(last) => self.interval().is_some_and(|interval| now - last >= interval),
        }
    }
}

/// Input for creating a flow definition.
#[derive(Debug, Clone, Deserialize)]
pub struct NewFlow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub run_interval: i64,
    pub configuration: Value,
}

impl NewFlow {
    pub fn new(name: impl Into<String>, run_interval: i64, configuration: Value) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            run_interval,
            configuration,
        }
    }

    #[cfg(test)]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        validate_definition(&self.name, self.run_interval, &self.configuration)
    }
}

/// Partial update of a flow definition. Outcome fields are not updatable here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub run_interval: Option<i64>,
    #[serde(default)]
    pub configuration: Option<Value>,
}

impl FlowUpdate {
    pub fn apply(self, flow: &mut Flow) -> Result<(), StoreError> {
        if let Some(name) = self.name {
            flow.name = name;
        }
        if let Some(description) = self.description {
            flow.description = description;
        }
        if let Some(enabled) = self.enabled {
            flow.enabled = enabled;
        }
        if let Some(run_interval) = self.run_interval {
            flow.run_interval = run_interval;
        }
        if let Some(configuration) = self.configuration {
            flow.configuration = configuration;
        }
        validate_definition(&flow.name, flow.run_interval, &flow.configuration)
    }
}

/// 100 years.
pub const MAX_RUN_INTERVAL_SECS: i64 = 100 * 366 * 24 * 60 * 60;

fn validate_definition(name: &str, run_interval: i64, configuration: &Value) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("name can't be blank".into()));
    }
    if run_interval <= 0 {
        return Err(StoreError::Validation(
            "run_interval must be greater than 0".into(),
        ));
    }
    if run_interval > MAX_RUN_INTERVAL_SECS {
        return Err(StoreError::Validation(format!(
            "run_interval must be at most {MAX_RUN_INTERVAL_SECS}"
        )));
    }
    if work_unit_name(configuration).is_none() {
        return Err(StoreError::Validation(
            "configuration must be a work unit name or an object with a class_name".into(),
        ));
    }
    Ok(())
}
