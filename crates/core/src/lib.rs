pub mod actuator;
pub mod classifier;
pub mod persistence;
pub mod pipeline;
pub mod transcript;
pub mod turn;

pub use actuator::{Actuator, ActuatorCoordinator, ActuatorError, IndicatorColor, IndicatorPattern};
pub use classifier::{ClassificationOutcome, Classifier, ClassifierClient, OfflineClassifier};
pub use persistence::{PersistError, PersistenceWriter};
pub use pipeline::{
    ControlReply, ControlSignal, PipelineError, PipelineHandle, SessionStart, TranscriptionEvent,
    TurnPipeline,
};
pub use transcript::{TranscriptStore, TranscriptView, TurnCounts};
pub use turn::{Classification, Turn, TurnView};
