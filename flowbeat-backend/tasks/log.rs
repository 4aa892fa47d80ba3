use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::flows::runner::WorkUnit;

pub const NAME: &str = "LogMessage";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Params {
    message: String,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            message: "heartbeat".to_string(),
        }
    }
}

/// Writes a line to the log. Useful for checking that the heartbeat fires.
pub struct LogMessage {
    message: String,
}

impl LogMessage {
    pub fn from_config(config: &Value) -> Result<Self> {
        let params: Params = super::parse_params(config)?;
        Ok(Self {
            message: params.message,
        })
    }
}

#[async_trait]
impl WorkUnit for LogMessage {
    async fn run(&self) -> Result<()> {
        tracing::info!(unit = NAME, "{}", self.message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_message() {
        let unit = LogMessage::from_config(&json!("LogMessage")).unwrap();
        assert_eq!(unit.message, "heartbeat");
    }

    #[tokio::test]
    async fn test_custom_message_runs() {
        let unit =
            LogMessage::from_config(&json!({ "class_name": "LogMessage", "message": "tick" }))
                .unwrap();
        assert_eq!(unit.message, "tick");
        unit.run().await.unwrap();
    }
}
