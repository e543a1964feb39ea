use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::conversation::ConversationTurn;
use crate::error::PetError;
use crate::pet::{Pet, PetEvent, PetStatus, PetView};
use crate::runtime::BackendRuntime;

#[derive(Clone)]
pub struct ServerState {
    pub pet: Arc<Pet>,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default, alias = "message")]
    content: String,
}

#[derive(Debug, Deserialize)]
struct MumbleRequest {
    #[serde(default, alias = "boboSentence")]
    content: String,
}

#[derive(Debug, Serialize)]
struct MumbleResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct CancelHugResponse {
    cancelled: bool,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<PetEvent>,
) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid BOBO_BACKEND_BIND (expected host:port)")?;

    let (ws_events, _) = broadcast::channel(512);
    spawn_event_bridge(event_rx, ws_events.clone());

    let (idle_shutdown, idle_task) = runtime.start().await?;

    let state = Arc::new(ServerState {
        pet: runtime.pet.clone(),
        ws_events,
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Bobo backend listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Backend server failed")?;

    let _ = idle_shutdown.send(true);
    if let Some(task) = idle_task {
        let _ = task.await;
    }
    tracing::info!("Bobo backend stopped");
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/get-messages", get(get_messages))
        .route("/chat", post(chat))
        .route("/mumble", post(mumble))
        .route("/hug", post(hug).delete(cancel_hug))
        .route("/reset", post(reset))
        .route("/status", get(status))
        .route("/ws/events", get(ws_events_route))
        .with_state(state);
    Router::new().nest("/v1", api)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for ctrl-c: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<PetEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_pet_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_pet_event(event: PetEvent) -> ApiEventEnvelope {
    match event {
        PetEvent::TurnAppended(turn) => envelope(
            "turn_appended",
            serde_json::json!({
                "turn": serde_json::to_value(turn).unwrap_or_else(|_| serde_json::json!({}))
            }),
        ),
        PetEvent::MoodChanged { state, asset } => envelope(
            "mood_changed",
            serde_json::json!({
                "mood": state.mood,
                "asset": asset,
                "hungry_level": state.hunger_level,
                "conversation_ended": state.conversation_ended
            }),
        ),
        PetEvent::ArbiterChanged(phase) => {
            envelope("arbiter_changed", serde_json::json!({ "phase": phase }))
        }
        PetEvent::HugStarted { asset } => {
            envelope("hug_started", serde_json::json!({ "asset": asset }))
        }
        PetEvent::LogReset(turns) => envelope(
            "log_reset",
            serde_json::json!({
                "turns": serde_json::to_value(turns).unwrap_or_else(|_| serde_json::json!([]))
            }),
        ),
        PetEvent::Error { kind, message } => envelope(
            "error",
            serde_json::json!({ "kind": kind, "error": message }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn status_for(error: &PetError) -> StatusCode {
    match error {
        PetError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PetError::Busy | PetError::Cancelled => StatusCode::CONFLICT,
        PetError::InvalidOracleResponse(_) => StatusCode::BAD_GATEWAY,
        PetError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        PetError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: PetError) -> ApiError {
    (
        status_for(&error),
        Json(ErrorBody {
            kind: error.kind(),
            error: error.to_string(),
        }),
    )
}

fn body_error(rejection: JsonRejection) -> ApiError {
    api_error(PetError::InvalidInput(rejection.body_text()))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_messages(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<ConversationTurn>>, ApiError> {
    state.pet.messages().await.map(Json).map_err(api_error)
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<PetView>, ApiError> {
    let Json(body) = body.map_err(body_error)?;
    state.pet.chat(&body.content).await.map(Json).map_err(api_error)
}

async fn mumble(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<MumbleRequest>, JsonRejection>,
) -> Result<Json<MumbleResponse>, ApiError> {
    let Json(body) = body.map_err(body_error)?;
    state.pet.mumble(&body.content).await.map_err(api_error)?;
    Ok(Json(MumbleResponse { success: true }))
}

async fn hug(State(state): State<Arc<ServerState>>) -> Result<Json<PetView>, ApiError> {
    state.pet.hug().await.map(Json).map_err(api_error)
}

async fn cancel_hug(State(state): State<Arc<ServerState>>) -> Json<CancelHugResponse> {
    Json(CancelHugResponse {
        cancelled: state.pet.cancel_hug(),
    })
}

async fn reset(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<ConversationTurn>>, ApiError> {
    state.pet.reset().await.map(Json).map_err(api_error)
}

async fn status(State(state): State<Arc<ServerState>>) -> Result<Json<PetStatus>, ApiError> {
    state.pet.status().await.map(Json).map_err(api_error)
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Event subscriber lagged, skipped {} event(s)", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PetConfig;
    use crate::pet::arbiter::ArbiterPhase;
    use crate::pet::deriver::tests::{ScriptedOracle, HAPPY_REPLY};
    use crate::pet::state::{Mood, PetState};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app(oracle: ScriptedOracle) -> (Router, Arc<Pet>) {
        let (tx, _rx) = flume::unbounded();
        let pet = Arc::new(Pet::new(
            PetConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(oracle),
            tx,
        ));
        let (ws_events, _) = broadcast::channel(16);
        let state = Arc::new(ServerState {
            pet: pet.clone(),
            ws_events,
        });
        (router(state), pet)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn read_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _pet) = test_app(ScriptedOracle::replying(HAPPY_REPLY));
        let response = app.oneshot(get_request("/v1/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn malformed_bodies_get_structured_invalid_input() {
        let (app, pet) = test_app(ScriptedOracle::replying(HAPPY_REPLY));

        let broken = Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .header("content-type", "application/json")
            .body(Body::from("{\"content\": "))
            .unwrap();
        let response = app.clone().oneshot(broken).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["kind"], "invalid_input");

        let plain = Request::builder()
            .method("POST")
            .uri("/v1/mumble")
            .body(Body::from("{\"content\": \"Bobo likes you.\"}"))
            .unwrap();
        let response = app.oneshot(plain).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(body["kind"], "invalid_input");
        assert!(body["error"].as_str().is_some());

        assert!(pet.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_returns_oracle_shaped_state_with_asset() {
        let (app, pet) = test_app(ScriptedOracle::replying(HAPPY_REPLY));
        let response = app
            .oneshot(post_json(
                "/v1/chat",
                serde_json::json!({ "message": "hello" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = read_json(response).await;
        assert_eq!(body["hungry_level"], 3);
        assert_eq!(body["Mood"], "happy");
        assert_eq!(body["reply"], "hi!");
        assert_eq!(body["isConvoEnd"], false);
        assert_eq!(body["asset"], "happy");
        assert_eq!(pet.messages().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn errors_map_to_status_and_kind() {
        let (app, _pet) = test_app(ScriptedOracle::replying("no json here"));

        let response = app
            .clone()
            .oneshot(post_json("/v1/chat", serde_json::json!({ "content": " " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["kind"], "invalid_input");

        let response = app
            .oneshot(post_json("/v1/chat", serde_json::json!({ "content": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(read_json(response).await["kind"], "invalid_oracle_response");
    }

    #[tokio::test]
    async fn unreachable_oracle_is_service_unavailable() {
        let (app, _pet) = test_app(ScriptedOracle::failing("connection refused"));
        let response = app
            .oneshot(post_json("/v1/chat", serde_json::json!({ "content": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = read_json(response).await;
        assert_eq!(body["kind"], "model_unavailable");
        assert!(body["error"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn chat_while_busy_is_conflict() {
        let (app, pet) = test_app(
            ScriptedOracle::replying(HAPPY_REPLY).with_delay(Duration::from_secs(10)),
        );
        let in_flight = tokio::spawn({
            let pet = pet.clone();
            async move { pet.chat("first").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let response = app
            .clone()
            .oneshot(post_json("/v1/chat", serde_json::json!({ "content": "second" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(read_json(response).await["kind"], "busy");

        let response = app
            .oneshot(post_json(
                "/v1/mumble",
                serde_json::json!({ "boboSentence": "It is quiet." }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        assert!(in_flight.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn mumble_then_messages_and_reset() {
        let (app, _pet) = test_app(ScriptedOracle::replying(HAPPY_REPLY));

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/mumble",
                serde_json::json!({ "boboSentence": "Bobo likes you." }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["success"], true);

        let response = app.clone().oneshot(get_request("/v1/get-messages")).await.unwrap();
        let turns = read_json(response).await;
        assert_eq!(turns.as_array().unwrap().len(), 1);
        assert_eq!(turns[0]["content"], "Bobo likes you.");
        assert_eq!(turns[0]["idle"], true);

        let response = app
            .clone()
            .oneshot(post_json("/v1/reset", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let seed = read_json(response).await;
        assert_eq!(seed[0]["role"], "pet");
        assert_eq!(seed[0]["content"], "Hi, I'm BoBo. Nice to meet you.");

        let response = app.oneshot(get_request("/v1/status")).await.unwrap();
        let status = read_json(response).await;
        assert_eq!(status["phase"], "idle");
        assert_eq!(status["asset"], "idle");
        assert_eq!(status["turn_count"], 1);
    }

    #[tokio::test]
    async fn cancel_without_pending_hug_reports_false() {
        let (app, _pet) = test_app(ScriptedOracle::replying(HAPPY_REPLY));
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/hug")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["cancelled"], false);
    }

    #[test]
    fn pet_events_map_to_named_envelopes() {
        let mood = map_pet_event(PetEvent::MoodChanged {
            state: PetState {
                hunger_level: 2,
                mood: Mood::Lonely,
                reply: "miss you".to_string(),
                conversation_ended: true,
            },
            asset: "lonely",
        });
        assert_eq!(mood.event_type, "mood_changed");
        assert_eq!(mood.payload["mood"], "lonely");
        assert_eq!(mood.payload["asset"], "lonely");
        assert_eq!(mood.payload["hungry_level"], 2);
        assert_eq!(mood.payload["conversation_ended"], true);

        let phase = map_pet_event(PetEvent::ArbiterChanged(ArbiterPhase::AwaitingModel));
        assert_eq!(phase.event_type, "arbiter_changed");
        assert_eq!(phase.payload["phase"], "awaiting_model");

        let turn = map_pet_event(PetEvent::TurnAppended(ConversationTurn::mumble("It is quiet.")));
        assert_eq!(turn.event_type, "turn_appended");
        assert_eq!(turn.payload["turn"]["idle"], true);

        let error = map_pet_event(PetEvent::Error {
            kind: "busy",
            message: "busy".to_string(),
        });
        assert_eq!(error.payload["kind"], "busy");
    }

    #[test]
    fn every_error_kind_has_a_status() {
        let cases = [
            (PetError::InvalidInput(String::new()), 400),
            (PetError::Busy, 409),
            (PetError::Cancelled, 409),
            (PetError::InvalidOracleResponse(String::new()), 502),
            (PetError::ModelUnavailable(String::new()), 503),
            (PetError::StoreUnavailable(String::new()), 500),
        ];
        for (error, code) in cases {
            assert_eq!(status_for(&error).as_u16(), code, "{error:?}");
        }
    }
}
