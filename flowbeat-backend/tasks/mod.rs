pub mod command;
pub mod http;
pub mod log;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::flows::runner::{WorkUnit, WorkUnitRegistry};

/// Registry with the work units that ship with the binary.
pub fn builtin_registry(http_client: Arc<reqwest::Client>) -> WorkUnitRegistry {
    let mut registry = WorkUnitRegistry::new();
    registry
        .register(log::NAME, |config| {
            Ok(Box::new(log::LogMessage::from_config(config)?) as Box<dyn WorkUnit>)
        })
        .register(http::NAME, move |config| {
            Ok(Box::new(http::HttpRequest::from_config(config, http_client.clone())?)
                as Box<dyn WorkUnit>)
        })
        .register(command::NAME, |config| {
            Ok(Box::new(command::ShellCommand::from_config(config)?) as Box<dyn WorkUnit>)
        });
    registry
}

/// Deserialize work-unit parameters. A bare-name configuration carries no
/// parameters and yields `T::default()`.
pub(crate) fn parse_params<T>(config: &Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match config {
        Value::Object(_) => {
            serde_json::from_value(config.clone()).context("invalid work unit parameters")
        }
        _ => Ok(T::default()),
    }
}
