use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::classifier::ClassificationOutcome;

/// The verdict attached to a turn.
///
/// A turn starts out `Pending` and moves to exactly one of the terminal
/// states when its classification request completes. Serialized with a
/// `state` tag, e.g. `{"state":"flagged","name":..,"reasoning":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Classification {
    Pending,
    Clean,
    Flagged { name: String, reasoning: String },
    Failed { reason: String },
}

impl Classification {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Classification::Pending)
    }

    pub fn is_flagged(&self) -> bool {
        matches!(self, Classification::Flagged { .. })
    }
}

impl From<ClassificationOutcome> for Classification {
    fn from(outcome: ClassificationOutcome) -> Self {
        match outcome {
            ClassificationOutcome::Clean => Classification::Clean,
            ClassificationOutcome::Flagged { name, reasoning } => {
                Classification::Flagged { name, reasoning }
            }
            ClassificationOutcome::Failed { reason } => Classification::Failed { reason },
        }
    }
}

/// Returned when something tries to resolve a turn that already has a verdict.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("turn {sequence} already resolved")]
pub struct AlreadyResolved {
    pub sequence: u64,
}

/// One finalized utterance within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    sequence: u64,
    timestamp: DateTime<Utc>,
    text: String,
    classification: Classification,
}

impl Turn {
    pub(crate) fn new(sequence: u64, timestamp: DateTime<Utc>, text: String) -> Self {
        Self {
            sequence,
            timestamp,
            text,
            classification: Classification::Pending,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    /// Moves the turn out of `Pending`. A turn is resolved at most once.
    pub(crate) fn resolve(&mut self, classification: Classification) -> Result<(), AlreadyResolved> {
        if self.classification.is_terminal() {
            return Err(AlreadyResolved {
                sequence: self.sequence,
            });
        }
        self.classification = classification;
        Ok(())
    }

    pub fn view(&self) -> TurnView {
        TurnView {
            sequence: self.sequence,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            text: self.text.clone(),
            classification: self.classification.clone(),
        }
    }
}

/// Serializable shape of a turn handed to the status reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnView {
    pub sequence: u64,
    pub timestamp: String,
    pub text: String,
    pub classification: Classification,
}
