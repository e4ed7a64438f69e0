use std::time::Duration;

use async_trait::async_trait;
use fallacy_core::actuator::{Actuator, ActuatorError, IndicatorPattern};
use reqwest::Client;

/// Device effects must land quickly or not at all.
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Drives the wearable through an HTTP bridge exposing `/speak` and `/indicator`.
pub struct HttpActuator {
    client: Client,
    base_url: String,
}

impl HttpActuator {
    pub fn new(base_url: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(BRIDGE_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }

    async fn post(&self, effect: &'static str, body: serde_json::Value) -> Result<(), ActuatorError> {
        let url = format!("{}/{}", self.base_url, effect);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ActuatorError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ActuatorError::Rejected {
                effect,
                message: resp.status().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for HttpActuator {
    async fn speak(&self, text: &str) -> Result<(), ActuatorError> {
        self.post("speak", serde_json::json!({ "text": text })).await
    }

    async fn set_indicator(&self, pattern: IndicatorPattern) -> Result<(), ActuatorError> {
        let body = serde_json::to_value(pattern).map_err(|e| ActuatorError::Rejected {
            effect: "indicator",
            message: e.to_string(),
        })?;
        self.post("indicator", body).await
    }
}
