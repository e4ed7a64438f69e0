use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fallacy_core::{
    Actuator, ActuatorCoordinator, Classifier, ClassifierClient, OfflineClassifier,
    PersistenceWriter, TurnPipeline, actuator::LogActuator,
};
use fallacy_service::bridge::HttpActuator;
use fallacy_service::config::{Config, PIPELINE_BUFFER};
use fallacy_service::server::{self, AppState};
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Listens to a conversation and flags logical fallacies as they happen")]
struct Cli {
    /// Overrides BIND_ADDRESS
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,
    /// Overrides TRANSCRIPT_DIR
    #[arg(long)]
    transcript_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load application configuration")?;
    let args = Cli::parse();
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(dir) = args.transcript_dir {
        config.transcript_dir = dir;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting fallacy monitor...");

    // --- 3. Initialize Clients ---
    let classifier: Arc<dyn Classifier> = match config.openai_api_key.clone() {
        Some(api_key) => Arc::new(
            ClassifierClient::new(
                api_key,
                config.chat_model.clone(),
                config.classifier_url.clone(),
                config.classifier_timeout,
            )
            .context("Failed to build classifier client")?,
        ),
        None => {
            tracing::warn!("OPENAI_API_KEY is not set, every utterance will be treated as clean");
            Arc::new(OfflineClassifier)
        }
    };

    let actuator: Arc<dyn Actuator> = match config.device_bridge_url.clone() {
        Some(url) => {
            tracing::info!("Driving device through bridge at {}", url);
            Arc::new(HttpActuator::new(url).context("Failed to build device bridge client")?)
        }
        None => {
            tracing::info!("DEVICE_BRIDGE_URL is not set, device effects will only be logged");
            Arc::new(LogActuator)
        }
    };

    // --- 4. Start the Turn Pipeline ---
    let pipeline = TurnPipeline::new(
        classifier,
        ActuatorCoordinator::new(actuator),
        PersistenceWriter::new(config.transcript_dir.clone()),
    );
    let store = pipeline.store();
    let (handle, _pipeline_task) = pipeline.spawn(PIPELINE_BUFFER);
    tracing::info!("Transcripts will be saved to {}", config.transcript_dir.display());

    // --- 5. Serve ---
    let app = server::router(AppState {
        pipeline: handle.clone(),
        store,
    });
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!("Listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Ctrl-C received, shutting down.");
        })
        .await
        .context("Server error")?;

    // --- 6. Save the active session before exiting ---
    match handle.end_current_session().await {
        Ok(Some(path)) => tracing::info!("Session saved to {}", path.display()),
        Ok(None) => tracing::info!("Session was already saved"),
        Err(e) => tracing::error!("Failed to save session on shutdown: {}", e),
    }

    Ok(())
}
