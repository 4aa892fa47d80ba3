use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

/// Configuration key naming the work unit when the configuration is an object.
pub const CLASS_NAME_KEY: &str = "class_name";

/// A pluggable unit of work. Built from a flow's configuration by a factory
/// registered under its name.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    async fn run(&self) -> Result<()>;
}

type Factory = Arc<dyn Fn(&Value) -> Result<Box<dyn WorkUnit>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
#[error("unresolvable work unit: {0}")]
pub struct UnresolvableWorkUnit(pub String);

/// Work-unit name carried by a configuration: the value itself when it is a
/// string, otherwise its `class_name` key.
pub fn work_unit_name(configuration: &Value) -> Option<&str> {
    let name = match configuration {
        Value::String(name) => name.as_str(),
        Value::Object(map) => map.get(CLASS_NAME_KEY)?.as_str()?,
        _ => return None,
    };
    Some(name).filter(|n| !n.trim().is_empty())
}

#[derive(Clone, Default)]
pub struct WorkUnitRegistry {
    factories: HashMap<String, Factory>,
}

impl WorkUnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn WorkUnit>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the work unit named by `configuration`, handing it the whole
    /// configuration value.
    pub fn resolve(&self, configuration: &Value) -> Result<Box<dyn WorkUnit>> {
        let name = work_unit_name(configuration)
            .ok_or_else(|| anyhow!("configuration does not name a work unit"))?;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| UnresolvableWorkUnit(name.to_string()))?;
        factory(configuration).with_context(|| format!("failed to construct work unit '{name}'"))
    }
}

/// Why a flow's work did not complete. Resolution, construction and run
/// errors all end up here.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub message: String,
    pub backtrace: Option<String>,
}

impl ExecutionFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
            backtrace: Some(format!("{err:?}")),
        }
    }
}

#[derive(Clone)]
pub struct FlowRunner {
    registry: Arc<WorkUnitRegistry>,
}

impl FlowRunner {
    pub fn new(registry: Arc<WorkUnitRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run(&self, configuration: &Value) -> Result<(), ExecutionFailure> {
        let unit = self
            .registry
            .resolve(configuration)
            .map_err(|e| ExecutionFailure::from_error(&e))?;
        unit.run().await.map_err(|e| ExecutionFailure::from_error(&e))
    }
}
