use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::actuator::ActuatorCoordinator;
use crate::classifier::{ClassificationOutcome, Classifier};
use crate::persistence::{PersistError, PersistenceWriter};
use crate::transcript::{SessionTranscript, TranscriptStore, TurnCounts};
use crate::turn::Classification;

/// Label of the session that exists before the first explicit start.
pub const DEFAULT_SESSION_LABEL: &str = "default";

/// One message from the upstream transcription transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionEvent {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptionEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn finalized(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    ShortPress,
    LongPress,
}

/// Where the most recent event left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Accumulating,
    Finalized,
    Dispatched,
    Resolved,
}

/// A finished classification, tagged with the turn and session it was made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub generation: u64,
    pub sequence: u64,
    pub outcome: ClassificationOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("turn pipeline is no longer running")]
    Closed,
    #[error(transparent)]
    Persist(#[from] PersistError),
}

pub type SaveReply = oneshot::Sender<Result<Option<PathBuf>, PersistError>>;

/// Outcome of starting a session.
#[derive(Debug)]
pub struct SessionStart {
    /// Generation of the new session. Pass it back to end exactly this session.
    pub generation: u64,
    /// Where the previous transcript was saved, if it needed saving. The new
    /// session starts even when that save fails.
    pub previous: Result<Option<PathBuf>, PersistError>,
}

pub enum PipelineEvent {
    SessionStarted {
        label: String,
        reply: Option<oneshot::Sender<SessionStart>>,
    },
    /// Ends the session with this generation, or the current one if `None`.
    SessionEnded {
        generation: Option<u64>,
        reply: Option<SaveReply>,
    },
    Transcription(TranscriptionEvent),
    ShortPress {
        reply: Option<oneshot::Sender<TurnCounts>>,
    },
    LongPress {
        reply: Option<oneshot::Sender<Result<PathBuf, PersistError>>>,
    },
}

/// The per-utterance state machine.
///
/// Events are handled one at a time. Each finalized utterance becomes a
/// `Pending` turn right away and its classification runs on its own task;
/// the verdict comes back later as a `Resolution` and is applied only if it
/// belongs to the current session generation.
pub struct TurnPipeline {
    classifier: Arc<dyn Classifier>,
    actuators: ActuatorCoordinator,
    writer: PersistenceWriter,
    store: TranscriptStore,
    generation: u64,
    state: PipelineState,
    saved_on_end: bool,
    resolved_tx: mpsc::UnboundedSender<Resolution>,
    resolved_rx: mpsc::UnboundedReceiver<Resolution>,
}

impl TurnPipeline {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        actuators: ActuatorCoordinator,
        writer: PersistenceWriter,
    ) -> Self {
        let generation = 1;
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        Self {
            classifier,
            actuators,
            writer,
            store: TranscriptStore::new(SessionTranscript::new(DEFAULT_SESSION_LABEL, generation)),
            generation,
            state: PipelineState::Idle,
            saved_on_end: false,
            resolved_tx,
            resolved_rx,
        }
    }

    /// Read-only handle for status readers.
    pub fn store(&self) -> TranscriptStore {
        self.store.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replaces the transcript with a fresh one for a new session.
    ///
    /// A non-empty previous transcript that was not already saved on session
    /// end is persisted first. Classifications still in flight are left to
    /// finish; their results no longer match the generation and get dropped.
    pub async fn start_session(&mut self, label: &str) -> SessionStart {
        let previous = self.store.snapshot().await;
        let saved = if previous.is_empty() || self.saved_on_end {
            Ok(None)
        } else {
            self.writer
                .persist(previous.turns(), previous.label())
                .await
                .map(Some)
        };
        if let Err(e) = &saved {
            tracing::error!("Could not save session '{}' before restart: {}", previous.label(), e);
        }

        self.generation += 1;
        self.store
            .replace(SessionTranscript::new(label, self.generation))
            .await;
        self.state = PipelineState::Idle;
        self.saved_on_end = false;
        tracing::info!("Session '{}' started (generation {})", label, self.generation);
        SessionStart {
            generation: self.generation,
            previous: saved,
        }
    }

    /// Closes the transcript of session `generation` and persists it.
    ///
    /// Ending a session that has already been replaced does nothing. The
    /// transcript stays addressable until the next session starts, so
    /// verdicts that arrive late are still recorded in memory.
    pub async fn end_session(&mut self, generation: u64) -> Result<Option<PathBuf>, PersistError> {
        if generation != self.generation {
            tracing::debug!(
                "Ignoring end of superseded generation {} (current {})",
                generation,
                self.generation
            );
            return Ok(None);
        }
        if self.saved_on_end {
            tracing::debug!("Session already ended and saved");
            return Ok(None);
        }
        let snapshot = self
            .store
            .update(|t| {
                t.close();
                t.clone()
            })
            .await;
        self.state = PipelineState::Idle;
        tracing::info!(
            "Session '{}' ended with {} turns",
            snapshot.label(),
            snapshot.turns().len()
        );

        let path = self.writer.persist(snapshot.turns(), snapshot.label()).await?;
        self.saved_on_end = true;
        Ok(Some(path))
    }

    /// Handles one transcription event. Returns the sequence of the turn it
    /// created, if any.
    pub async fn ingest(&mut self, event: TranscriptionEvent) -> Option<u64> {
        if self.store.is_closed().await {
            tracing::warn!("Ignoring transcription after session end: \"{}\"", event.text);
            return None;
        }

        if !event.is_final {
            // Each partial replaces the previous one.
            self.store
                .update(|t| t.set_in_progress(Some(event.text)))
                .await;
            self.state = PipelineState::Accumulating;
            return None;
        }

        let text = event.text.trim();
        if text.is_empty() {
            self.store.update(|t| t.set_in_progress(None)).await;
            self.state = PipelineState::Idle;
            return None;
        }
        let text = text.to_string();

        // The turn is visible to readers before the classifier is called.
        let sequence = self
            .store
            .update(|t| {
                t.set_in_progress(None);
                t.append(text.clone(), Utc::now())
            })
            .await;
        self.state = PipelineState::Finalized;
        tracing::info!("Turn {} finalized: \"{}\"", sequence, text);

        self.dispatch(sequence, text);
        self.state = PipelineState::Dispatched;
        Some(sequence)
    }

    fn dispatch(&self, sequence: u64, text: String) {
        let classifier = Arc::clone(&self.classifier);
        let resolved_tx = self.resolved_tx.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            // Run the call on its own task so a panicking classifier still
            // produces a verdict for this turn.
            let call = tokio::spawn(async move { classifier.classify(&text).await });
            let outcome = match call.await {
                Ok(outcome) => outcome,
                Err(e) => ClassificationOutcome::Failed {
                    reason: format!("classification task aborted: {e}"),
                },
            };
            // The pipeline may already be gone; then there is nothing to update.
            let _ = resolved_tx.send(Resolution {
                generation,
                sequence,
                outcome,
            });
        });
    }

    /// Waits for the next finished classification.
    pub async fn next_resolution(&mut self) -> Option<Resolution> {
        self.resolved_rx.recv().await
    }

    /// Records a verdict on its turn and fires the matching effects.
    /// Returns false if the result was discarded.
    pub async fn apply_resolution(&mut self, resolution: Resolution) -> bool {
        let Resolution {
            generation,
            sequence,
            outcome,
        } = resolution;

        if generation != self.generation {
            tracing::debug!(
                "Discarding verdict for turn {} of stale generation {} (current {})",
                sequence,
                generation,
                self.generation
            );
            return false;
        }

        let classification = Classification::from(outcome.clone());
        if let Err(e) = self
            .store
            .update(|t| t.resolve(sequence, classification))
            .await
        {
            tracing::warn!("Could not record verdict: {}", e);
            return false;
        }
        self.state = PipelineState::Resolved;

        let actuators = self.actuators.clone();
        match outcome {
            ClassificationOutcome::Clean => {
                tracing::debug!("Turn {} is clean", sequence);
                tokio::spawn(async move { actuators.on_clean().await });
            }
            ClassificationOutcome::Flagged { name, reasoning } => {
                tracing::info!("Turn {} flagged: {} ({})", sequence, name, reasoning);
                tokio::spawn(async move { actuators.on_flagged(&name).await });
            }
            ClassificationOutcome::Failed { reason } => {
                tracing::warn!("No verdict for turn {}: {}", sequence, reason);
            }
        }
        true
    }

    pub async fn short_press(&mut self) -> TurnCounts {
        let counts = self.store.counts().await;
        tracing::info!(
            "Report: {} turns, {} flagged",
            counts.total_turns,
            counts.fallacy_count
        );
        let actuators = self.actuators.clone();
        tokio::spawn(async move { actuators.on_report(counts).await });
        counts
    }

    /// Saves a snapshot of the current transcript right away.
    pub async fn long_press(&mut self) -> Result<PathBuf, PersistError> {
        let snapshot = self.store.snapshot().await;
        self.writer
            .persist(snapshot.turns(), snapshot.label())
            .await
    }

    pub async fn handle(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::SessionStarted { label, reply } => {
                let start = self.start_session(&label).await;
                send_reply(reply, start);
            }
            PipelineEvent::SessionEnded { generation, reply } => {
                let generation = generation.unwrap_or(self.generation);
                let result = self.end_session(generation).await;
                if let Err(e) = &result {
                    tracing::error!("Failed to save transcript on session end: {}", e);
                }
                send_reply(reply, result);
            }
            PipelineEvent::Transcription(event) => {
                self.ingest(event).await;
            }
            PipelineEvent::ShortPress { reply } => {
                let counts = self.short_press().await;
                send_reply(reply, counts);
            }
            PipelineEvent::LongPress { reply } => {
                let result = self.long_press().await;
                if let Err(e) = &result {
                    tracing::error!("Failed to save transcript on long press: {}", e);
                }
                send_reply(reply, result);
            }
        }
    }

    /// Drives the pipeline until the event stream closes, which counts as
    /// the end of the session.
    pub async fn run(mut self, mut events: mpsc::Receiver<PipelineEvent>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        tracing::info!("Event stream closed, ending session");
                        if let Err(e) = self.end_session(self.generation).await {
                            tracing::error!("Failed to save transcript on shutdown: {}", e);
                        }
                        break;
                    }
                },
                Some(resolution) = self.resolved_rx.recv() => {
                    self.apply_resolution(resolution).await;
                }
            }
        }
    }

    /// Moves the pipeline onto its own task.
    pub fn spawn(self, buffer: usize) -> (PipelineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer);
        let task = tokio::spawn(self.run(rx));
        (PipelineHandle { tx }, task)
    }
}

fn send_reply<T>(reply: Option<oneshot::Sender<T>>, value: T) {
    if let Some(reply) = reply {
        // The requester may have given up waiting.
        let _ = reply.send(value);
    }
}

/// Cloneable sender side of a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineEvent>,
}

impl PipelineHandle {
    async fn send(&self, event: PipelineEvent) -> Result<(), PipelineError> {
        self.tx.send(event).await.map_err(|_| PipelineError::Closed)
    }

    pub async fn transcription(&self, event: TranscriptionEvent) -> Result<(), PipelineError> {
        self.send(PipelineEvent::Transcription(event)).await
    }

    pub async fn start_session(&self, label: impl Into<String>) -> Result<SessionStart, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.send(PipelineEvent::SessionStarted {
            label: label.into(),
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| PipelineError::Closed)
    }

    /// Ends the session started with `generation`. A no-op once another
    /// session has replaced it.
    pub async fn end_session(&self, generation: u64) -> Result<Option<PathBuf>, PipelineError> {
        self.end(Some(generation)).await
    }

    /// Ends whichever session is current.
    pub async fn end_current_session(&self) -> Result<Option<PathBuf>, PipelineError> {
        self.end(None).await
    }

    async fn end(&self, generation: Option<u64>) -> Result<Option<PathBuf>, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.send(PipelineEvent::SessionEnded {
            generation,
            reply: Some(reply),
        })
        .await?;
        Ok(rx.await.map_err(|_| PipelineError::Closed)??)
    }

    pub async fn control(&self, signal: ControlSignal) -> Result<ControlReply, PipelineError> {
        match signal {
            ControlSignal::ShortPress => {
                let (reply, rx) = oneshot::channel();
                self.send(PipelineEvent::ShortPress { reply: Some(reply) })
                    .await?;
                let counts = rx.await.map_err(|_| PipelineError::Closed)?;
                Ok(ControlReply::Counts(counts))
            }
            ControlSignal::LongPress => {
                let (reply, rx) = oneshot::channel();
                self.send(PipelineEvent::LongPress { reply: Some(reply) })
                    .await?;
                let path = rx.await.map_err(|_| PipelineError::Closed)??;
                Ok(ControlReply::Saved(path))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Counts(TurnCounts),
    Saved(PathBuf),
}
