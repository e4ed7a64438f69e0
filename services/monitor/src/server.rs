use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fallacy_core::{
    ControlReply, ControlSignal, PipelineError, PipelineHandle, TranscriptStore, TranscriptView,
    TranscriptionEvent, TurnCounts,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: PipelineHandle,
    pub store: TranscriptStore,
}

/// Frames a transport client may send on `/ws`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Transcription(TranscriptionEvent),
    Control { signal: ControlSignal },
}

/// Replies sent back on `/ws` for control frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Counts(TurnCounts),
    Saved { path: String },
    Error { message: String },
}

impl From<ControlReply> for ServerMessage {
    fn from(reply: ControlReply) -> Self {
        match reply {
            ControlReply::Counts(counts) => ServerMessage::Counts(counts),
            ControlReply::Saved(path) => ServerMessage::Saved {
                path: path.display().to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    session: Option<String>,
}

#[derive(Debug, Serialize)]
struct SavedResponse {
    path: String,
}

pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PipelineError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    // Permissive CORS so a separately served status page can poll the API.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/transcript", get(transcript))
        .route("/api/stats", get(stats))
        .route("/api/control/short-press", post(short_press))
        .route("/api/control/long-press", post(long_press))
        .layer(cors)
        .with_state(state)
}

async fn transcript(State(state): State<AppState>) -> Json<TranscriptView> {
    Json(state.store.view().await)
}

async fn stats(State(state): State<AppState>) -> Json<TurnCounts> {
    Json(state.store.counts().await)
}

fn reply_response(reply: ControlReply) -> Response {
    match reply {
        ControlReply::Counts(counts) => Json(counts).into_response(),
        ControlReply::Saved(path) => Json(SavedResponse {
            path: path.display().to_string(),
        })
        .into_response(),
    }
}

async fn short_press(State(state): State<AppState>) -> Result<Response, ApiError> {
    let reply = state.pipeline.control(ControlSignal::ShortPress).await?;
    Ok(reply_response(reply))
}

/// Responds with the saved path, or 500 when the transcript could not be written.
async fn long_press(State(state): State<AppState>) -> Result<Response, ApiError> {
    let reply = state.pipeline.control(ControlSignal::LongPress).await?;
    Ok(reply_response(reply))
}

/// Each connection is one session: opening it starts a session, closing it ends one.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let label = params
        .session
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("WebSocket upgrade request received for session '{}'", label);
    ws.on_upgrade(move |socket| handle_socket(socket, state, label))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, label: String) {
    info!("WebSocket connection established");

    let generation = match state.pipeline.start_session(label.as_str()).await {
        Ok(start) => {
            match start.previous {
                Ok(Some(path)) => info!("Previous session saved to {}", path.display()),
                Ok(None) => {}
                // The new session still started.
                Err(e) => warn!("Previous session could not be saved: {}", e),
            }
            start.generation
        }
        Err(e) => {
            warn!("Turn pipeline is not running, closing connection: {}", e);
            return;
        }
    };

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                info!("WebSocket error: {}", e);
                break;
            }
        };

        let message = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed frame: {}", e);
                continue;
            }
        };

        match message {
            ClientMessage::Transcription(event) => {
                if state.pipeline.transcription(event).await.is_err() {
                    warn!("Turn pipeline stopped, closing connection");
                    break;
                }
            }
            ClientMessage::Control { signal } => {
                let reply = match state.pipeline.control(signal).await {
                    Ok(reply) => ServerMessage::from(reply),
                    Err(PipelineError::Closed) => break,
                    Err(e) => ServerMessage::Error {
                        message: e.to_string(),
                    },
                };
                let Ok(json) = serde_json::to_string(&reply) else {
                    continue;
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    // Client disconnected.
                    break;
                }
            }
        }
    }

    // Losing the stream ends this connection's session, unless a newer
    // connection has already replaced it.
    match state.pipeline.end_session(generation).await {
        Ok(Some(path)) => info!("Session '{}' saved to {}", label, path.display()),
        Ok(None) => {}
        Err(e) => warn!("Session '{}' could not be saved: {}", label, e),
    }
    info!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fallacy_core::{
        ActuatorCoordinator, OfflineClassifier, PersistenceWriter, TurnPipeline,
        actuator::LogActuator,
    };
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite;

    async fn start() -> (String, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = TurnPipeline::new(
            Arc::new(OfflineClassifier),
            ActuatorCoordinator::new(Arc::new(LogActuator)),
            PersistenceWriter::new(dir.path()),
        );
        let store = pipeline.store();
        let (handle, _task) = pipeline.spawn(16);
        let app = router(AppState {
            pipeline: handle,
            store,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.to_string(), dir)
    }

    async fn get_transcript(addr: &str) -> serde_json::Value {
        reqwest::get(format!("http://{addr}/api/transcript"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn wait_for(addr: &str, check: impl Fn(&serde_json::Value) -> bool) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let view = get_transcript(addr).await;
                if check(&view) {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("status never reached the expected state")
    }

    #[tokio::test]
    async fn test_websocket_session_end_to_end() {
        let (addr, dir) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?session=demo"))
            .await
            .unwrap();

        for frame in [
            r#"{"type": "transcription", "text": "So you", "isFinal": false}"#,
            "not json at all",
            r#"{"type": "transcription", "text": "So you think taxes are theft?", "isFinal": true}"#,
            r#"{"type": "transcription", "text": "   ", "isFinal": true}"#,
        ] {
            ws.send(tungstenite::Message::text(frame)).await.unwrap();
        }

        let view = wait_for(&addr, |v| {
            v["session"] == "demo" && v["turns"][0]["classification"]["state"] == "clean"
        })
        .await;
        assert_eq!(view["turns"].as_array().unwrap().len(), 1);
        assert_eq!(view["turns"][0]["sequence"], 1);
        assert_eq!(view["turns"][0]["text"], "So you think taxes are theft?");
        assert_eq!(view["in_progress"], serde_json::Value::Null);

        ws.send(tungstenite::Message::text(
            r#"{"type": "control", "signal": "short_press"}"#,
        ))
        .await
        .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(
            reply,
            serde_json::json!({ "type": "counts", "total_turns": 1, "fallacy_count": 0 })
        );

        ws.close(None).await.unwrap();
        wait_for(&addr, |v| v["closed"] == true).await;
        // The end-of-session save lands right after the close flag.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let saved = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn test_closing_replaced_connection_keeps_live_session() {
        let (addr, dir) = start().await;
        let (mut first, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?session=a"))
            .await
            .unwrap();
        wait_for(&addr, |v| v["session"] == "a").await;
        let (mut second, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?session=b"))
            .await
            .unwrap();
        wait_for(&addr, |v| v["session"] == "b").await;

        first.close(None).await.unwrap();
        // Give the server time to process the close of the replaced connection.
        tokio::time::sleep(Duration::from_millis(100)).await;
        second
            .send(tungstenite::Message::text(
                r#"{"type": "transcription", "text": "Nobody disagrees with me.", "isFinal": true}"#,
            ))
            .await
            .unwrap();

        let view = wait_for(&addr, |v| v["turns"].as_array().is_some_and(|t| t.len() == 1)).await;
        assert_eq!(view["session"], "b");
        assert_eq!(view["closed"], false);
        assert_eq!(view["turns"][0]["text"], "Nobody disagrees with me.");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        second.close(None).await.unwrap();
        wait_for(&addr, |v| v["closed"] == true).await;
    }

    #[tokio::test]
    async fn test_control_endpoints() {
        let (addr, dir) = start().await;
        let client = reqwest::Client::new();

        let counts: serde_json::Value = client
            .post(format!("http://{addr}/api/control/short-press"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(counts, serde_json::json!({ "total_turns": 0, "fallacy_count": 0 }));

        let resp = client
            .post(format!("http://{addr}/api/control/long-press"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let saved: serde_json::Value = resp.json().await.unwrap();
        let path = saved["path"].as_str().unwrap();
        assert!(path.starts_with(&dir.path().display().to_string()));

        let stats: serde_json::Value = reqwest::get(format!("http://{addr}/api/stats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["total_turns"], 0);
    }
}
