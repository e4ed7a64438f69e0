use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::turn::{AlreadyResolved, Classification, Turn, TurnView};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no turn with sequence {0} in this transcript")]
    UnknownTurn(u64),
    #[error(transparent)]
    AlreadyResolved(#[from] AlreadyResolved),
}

/// Aggregate numbers reported on a short press.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurnCounts {
    pub total_turns: usize,
    pub fallacy_count: usize,
}

impl TurnCounts {
    pub fn of(turns: &[Turn]) -> Self {
        Self {
            total_turns: turns.len(),
            fallacy_count: turns
                .iter()
                .filter(|t| t.classification().is_flagged())
                .count(),
        }
    }
}

/// Ordered turns of one session.
///
/// Sequences start at 1 and are handed out by `append`, so the list is
/// always ordered, gapless and free of duplicates.
#[derive(Debug, Clone)]
pub struct SessionTranscript {
    label: String,
    generation: u64,
    started_at: DateTime<Utc>,
    closed: bool,
    in_progress: Option<String>,
    turns: Vec<Turn>,
}

impl SessionTranscript {
    pub fn new(label: impl Into<String>, generation: u64) -> Self {
        Self {
            label: label.into(),
            generation,
            started_at: Utc::now(),
            closed: false,
            in_progress: None,
            turns: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn in_progress(&self) -> Option<&str> {
        self.in_progress.as_deref()
    }

    pub(crate) fn append(&mut self, text: String, timestamp: DateTime<Utc>) -> u64 {
        let sequence = self.turns.len() as u64 + 1;
        self.turns.push(Turn::new(sequence, timestamp, text));
        sequence
    }

    pub(crate) fn resolve(
        &mut self,
        sequence: u64,
        classification: Classification,
    ) -> Result<(), ResolveError> {
        // Sequence n lives at index n - 1.
        let turn = sequence
            .checked_sub(1)
            .and_then(|idx| self.turns.get_mut(idx as usize))
            .ok_or(ResolveError::UnknownTurn(sequence))?;
        turn.resolve(classification)?;
        Ok(())
    }

    pub(crate) fn set_in_progress(&mut self, text: Option<String>) {
        self.in_progress = text;
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.in_progress = None;
    }

    pub fn counts(&self) -> TurnCounts {
        TurnCounts::of(&self.turns)
    }

    pub fn view(&self) -> TranscriptView {
        TranscriptView {
            session: self.label.clone(),
            generation: self.generation,
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            closed: self.closed,
            in_progress: self.in_progress.clone(),
            counts: self.counts(),
            turns: self.turns.iter().map(Turn::view).collect(),
        }
    }
}

/// What the status reader sees when it polls.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptView {
    pub session: String,
    pub generation: u64,
    pub started_at: String,
    pub closed: bool,
    pub in_progress: Option<String>,
    pub counts: TurnCounts,
    pub turns: Vec<TurnView>,
}

/// Shared handle to the active session transcript.
///
/// Clones share the same slot. Consumers only get point-in-time copies;
/// writes go through crate-private methods used by the pipeline.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    inner: Arc<RwLock<SessionTranscript>>,
}

impl TranscriptStore {
    pub fn new(initial: SessionTranscript) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn snapshot(&self) -> SessionTranscript {
        self.inner.read().await.clone()
    }

    pub async fn view(&self) -> TranscriptView {
        self.inner.read().await.view()
    }

    pub async fn counts(&self) -> TurnCounts {
        self.inner.read().await.counts()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.is_closed()
    }

    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation()
    }

    /// Swaps in a new transcript and hands back the old one.
    pub(crate) async fn replace(&self, next: SessionTranscript) -> SessionTranscript {
        let mut guard = self.inner.write().await;
        std::mem::replace(&mut *guard, next)
    }

    pub(crate) async fn update<T>(&self, f: impl FnOnce(&mut SessionTranscript) -> T) -> T {
        let mut guard = self.inner.write().await;
        f(&mut *guard)
    }
}
