//! WebSocket server + REST endpoints for routines and their notifications.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        FromRequestParts, Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderName, Method, StatusCode, header::CONTENT_TYPE, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use super::completion::CompletionTracker;
use super::engine::ReminderEngine;
use super::model::{Invocation, Routine, RoutineDraft, is_scheduled_today, reorder, toggle_day};
use super::notifications::{NotificationEvent, NotificationManager};
use crate::clock::Clock;
use crate::error::{RoutineError, StoreError};
use crate::store::RoutineStore;

/// Header carrying the caller identity, set by the upstream identity provider.
pub const USER_HEADER: &str = "x-user-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RoutineStore>,
    pub clock: Arc<dyn Clock>,
    pub tracker: Arc<CompletionTracker>,
    pub engine: Arc<ReminderEngine>,
    pub notifications: NotificationManager,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RoutineStore>,
        clock: Arc<dyn Clock>,
        engine: Arc<ReminderEngine>,
    ) -> Self {
        let tracker = Arc::new(CompletionTracker::new(store.clone(), clock.clone()));
        let notifications = engine.notifications().clone();
        Self {
            store,
            clock,
            tracker,
            engine,
            notifications,
        }
    }
}

/// Build the Axum router with routine REST and notification WebSocket routes.
pub fn routine_routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(USER_HEADER)]);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/routines", get(list_routines).post(create_routine))
        .route("/api/routines/today", get(routines_today))
        .route("/api/routines/order", put(reorder_routines))
        .route(
            "/api/routines/{id}",
            get(get_routine).put(update_routine).delete(delete_routine),
        )
        .route("/api/routines/{id}/complete", post(complete_routine))
        .route("/api/routines/{id}/days/{day}", post(toggle_routine_day))
        .route("/api/routines/{id}/notify", post(notify_routine))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/{id}/dismiss", post(dismiss_notification))
        .route("/api/notifications/{id}/activate", post(activate_notification))
        .layer(cors)
        .with_state(state)
}

// ── Errors & identity ───────────────────────────────────────────────────

/// Handler error, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    MissingUser,
    Routine(RoutineError),
}

impl From<RoutineError> for ApiError {
    fn from(err: RoutineError) -> Self {
        ApiError::Routine(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Routine(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingUser => StatusCode::UNAUTHORIZED,
            ApiError::Routine(RoutineError::InvalidDay { .. } | RoutineError::Invalid { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Routine(RoutineError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Routine(RoutineError::Persistence(e)) => {
                error!(error = %e, "Persistence failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match self {
            ApiError::MissingUser => format!("Missing {USER_HEADER} header"),
            ApiError::Routine(e) => e.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// The authenticated caller.
pub struct UserId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or(ApiError::MissingUser)
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "jin-routines"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

/// Initial snapshot sent to a client on connect.
#[derive(Serialize)]
#[serde(tag = "type", rename = "notifications_sync")]
struct NotificationsSync {
    notifications: Vec<NotificationEvent>,
}

/// Actions a client can send over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum NotificationAction {
    Dismiss { routine_id: String },
    Activate { routine_id: String },
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    UserId(user): UserId,
) -> impl IntoResponse {
    info!(user_id = %user, "WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state.notifications, user))
}

async fn send_sync(socket: &mut WebSocket, notifications: &NotificationManager, user: &str) -> bool {
    let sync = NotificationsSync {
        notifications: notifications.active(user).await,
    };
    match serde_json::to_string(&sync) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode notification sync");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, notifications: NotificationManager, user: String) {
    info!("WebSocket client connected");

    // Subscribe before the snapshot so no update falls between the two.
    let mut rx = notifications.subscribe();

    if !send_sync(&mut socket, &notifications, &user).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(update) if update.user_id() != user => {}
                    Ok(update) => {
                        if let Ok(json) = serde_json::to_string(&update) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &notifications, &user).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &notifications, &user).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn handle_client_message(text: &str, notifications: &NotificationManager, user: &str) {
    match serde_json::from_str::<NotificationAction>(text) {
        Ok(NotificationAction::Dismiss { routine_id }) => {
            if !notifications.dismiss(user, &routine_id).await {
                debug!(routine_id = %routine_id, "Dismiss via WS ignored, nothing pending");
            }
        }
        Ok(NotificationAction::Activate { routine_id }) => {
            if !notifications.activate(user, &routine_id).await {
                debug!(routine_id = %routine_id, "Activate via WS ignored, nothing pending");
            }
        }
        Err(e) => {
            debug!(error = %e, text = text, "Unrecognized WS message from client");
        }
    }
}

// ── Routine endpoints ───────────────────────────────────────────────────

async fn list_routines(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Result<Json<Vec<Routine>>, ApiError> {
    Ok(Json(state.store.list_routines(&user).await?))
}

async fn routines_today(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Result<Json<Vec<Routine>>, ApiError> {
    let today = state
        .clock
        .now()
        .with_timezone(&chrono::Local)
        .date_naive();
    let routines = state
        .store
        .list_routines(&user)
        .await?
        .into_iter()
        .filter(|r| {
            is_scheduled_today(r, chrono::Datelike::weekday(&today), Invocation::Automatic)
        })
        .collect();
    Ok(Json(routines))
}

async fn create_routine(
    State(state): State<AppState>,
    UserId(user): UserId,
    Json(draft): Json<RoutineDraft>,
) -> Result<(StatusCode, Json<Routine>), ApiError> {
    let position = state
        .store
        .list_routines(&user)
        .await?
        .iter()
        .map(|r| r.position)
        .max()
        .map_or(0, |p| p + 1);
    let routine = draft.into_routine(&user, position, state.clock.now())?;
    state.store.create_routine(&routine).await?;
    info!(routine_id = %routine.id, user_id = %user, "Routine created");
    Ok((StatusCode::CREATED, Json(routine)))
}

async fn get_routine(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<Routine>, ApiError> {
    Ok(Json(state.store.get_routine(&user, &id).await?))
}

async fn update_routine(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(draft): Json<RoutineDraft>,
) -> Result<Json<Routine>, ApiError> {
    let mut routine = state.store.get_routine(&user, &id).await?;
    draft.apply_to(&mut routine, state.clock.now())?;
    state.store.update_routine(&user, &routine).await?;
    Ok(Json(routine))
}

async fn delete_routine(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete_routine(&user, &id).await?;
    // A deleted routine must not leave a popup behind.
    state.notifications.withdraw(&user, &id).await;
    info!(routine_id = %id, user_id = %user, "Routine deleted");
    Ok(Json(serde_json::json!({"status": "deleted"})))
}

async fn complete_routine(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<Routine>, ApiError> {
    Ok(Json(state.tracker.toggle_by_id(&user, &id).await?))
}

async fn toggle_routine_day(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path((id, day)): Path<(String, String)>,
) -> Result<Json<Routine>, ApiError> {
    let mut routine = state.store.get_routine(&user, &id).await?;
    routine.repeat_days = toggle_day(&routine, &day)?;
    routine.updated_at = state.clock.now();
    state.store.update_routine(&user, &routine).await?;
    Ok(Json(routine))
}

#[derive(Deserialize)]
struct ReorderRequest {
    routine_id: String,
    to_index: usize,
}

async fn reorder_routines(
    State(state): State<AppState>,
    UserId(user): UserId,
    Json(body): Json<ReorderRequest>,
) -> Result<Json<Vec<Routine>>, ApiError> {
    let mut routines = state.store.list_routines(&user).await?;
    let before: HashMap<String, i64> = routines
        .iter()
        .map(|r| (r.id.clone(), r.position))
        .collect();

    reorder(&mut routines, &body.routine_id, body.to_index)?;

    let now = state.clock.now();
    let moved: Vec<(String, i64)> = routines
        .iter()
        .filter(|r| before.get(&r.id) != Some(&r.position))
        .map(|r| (r.id.clone(), r.position))
        .collect();
    state.store.set_positions(&user, &moved, now).await?;
    for routine in routines.iter_mut() {
        if before.get(&routine.id) != Some(&routine.position) {
            routine.updated_at = now;
        }
    }
    Ok(Json(routines))
}

// ── Notification endpoints ──────────────────────────────────────────────

async fn notify_routine(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let routine = state.engine.fire_manual(&user, &id).await?;
    Ok(Json(
        serde_json::json!({"status": "scheduled", "routine_id": routine.id}),
    ))
}

async fn list_notifications(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Json<Vec<NotificationEvent>> {
    Json(state.notifications.active(&user).await)
}

async fn dismiss_notification(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let dismissed = state.notifications.dismiss(&user, &id).await;
    Json(serde_json::json!({"routine_id": id, "dismissed": dismissed}))
}

async fn activate_notification(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let activated = state.notifications.activate(&user, &id).await;
    Json(serde_json::json!({"routine_id": id, "activated": activated}))
}
