use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;

use crate::transcript::TurnCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorColor {
    Red,
    Green,
}

/// One indicator effect: `on_ms` lit, then optionally `off_ms` dark, `repeat` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorPattern {
    pub color: IndicatorColor,
    pub on_duration_ms: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub off_duration_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_count: Option<u32>,
}

/// Pulse sent once per flagged turn.
pub const ALERT_PULSE: IndicatorPattern = IndicatorPattern {
    color: IndicatorColor::Red,
    on_duration_ms: 300,
    off_duration_ms: Some(200),
    repeat_count: Some(2),
};

/// Pulse sent once per clean turn.
pub const CLEAN_PULSE: IndicatorPattern = IndicatorPattern {
    color: IndicatorColor::Green,
    on_duration_ms: 150,
    off_duration_ms: None,
    repeat_count: None,
};

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("device rejected {effect}: {message}")]
    Rejected { effect: &'static str, message: String },
}

/// Output devices driven by verdicts: a speech engine and an indicator light.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait Actuator: Send + Sync {
    async fn speak(&self, text: &str) -> Result<(), ActuatorError>;

    async fn set_indicator(&self, pattern: IndicatorPattern) -> Result<(), ActuatorError>;
}

/// Turns verdicts into device effects.
///
/// Every method is best effort: failures are logged and swallowed, so the
/// caller never learns about them and pipeline state never depends on them.
#[derive(Clone)]
pub struct ActuatorCoordinator {
    actuator: Arc<dyn Actuator>,
}

impl ActuatorCoordinator {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self { actuator }
    }

    pub async fn on_flagged(&self, name: &str) {
        // Both effects are attempted even when the other one fails.
        let (spoken, pulsed) = tokio::join!(
            self.actuator.speak(name),
            self.actuator.set_indicator(ALERT_PULSE)
        );
        if let Err(e) = spoken {
            tracing::warn!("Failed to speak fallacy name '{}': {}", name, e);
        }
        if let Err(e) = pulsed {
            tracing::warn!("Failed to pulse alert indicator: {}", e);
        }
    }

    pub async fn on_clean(&self) {
        if let Err(e) = self.actuator.set_indicator(CLEAN_PULSE).await {
            tracing::warn!("Failed to pulse clean indicator: {}", e);
        }
    }

    pub async fn on_report(&self, counts: TurnCounts) {
        let summary = report_phrase(counts);
        if let Err(e) = self.actuator.speak(&summary).await {
            tracing::warn!("Failed to speak session report: {}", e);
        }
    }
}

fn report_phrase(counts: TurnCounts) -> String {
    let plural = |n: usize, one: &str, many: &str| {
        if n == 1 {
            format!("{n} {one}")
        } else {
            format!("{n} {many}")
        }
    };
    format!(
        "{}, {}",
        plural(counts.total_turns, "turn", "turns"),
        plural(counts.fallacy_count, "fallacy", "fallacies")
    )
}

/// Used when no device is attached: effects only show up in the log.
pub struct LogActuator;

#[async_trait]
impl Actuator for LogActuator {
    async fn speak(&self, text: &str) -> Result<(), ActuatorError> {
        tracing::info!("SPEAK: {}", text);
        Ok(())
    }

    async fn set_indicator(&self, pattern: IndicatorPattern) -> Result<(), ActuatorError> {
        tracing::info!("INDICATOR: {:?}", pattern);
        Ok(())
    }
}
