use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use push_gateway::{DisabledPushGateway, HttpPushGateway, PushDispatcher};
use server_api::{messages_after, submit_message, ApiContext, RoomRegistry};
use shared::{
    domain::{ChannelId, Message, UserId},
    error::ApiError,
    protocol::{
        DeltaQuery, MembershipQuery, RegisterPushTokenRequest, SubmitRequest, SubmitResponse,
        UpdateChannelRequest,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod config;
mod ws;

use config::load_settings;

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub struct AppState {
    pub api: ApiContext,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let storage = Storage::new(&settings.database_url).await.map_err(|err| {
        error!(
            database_url = %settings.database_url,
            %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;

    let push: Arc<dyn PushDispatcher> = match &settings.push_gateway_url {
        Some(url) => Arc::new(HttpPushGateway::new(url.clone())),
        None => Arc::new(DisabledPushGateway),
    };

    let api = ApiContext {
        storage,
        rooms: Arc::new(RoomRegistry::new()),
        push,
    };
    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/send-message", post(http_send_message))
        .route("/api/register-push-token", post(register_push_token))
        .route("/api/unregister-push-token", post(unregister_push_token))
        .route("/api/update-channel", post(update_channel))
        .route("/channels/:channel_id/messages", get(http_delta_fetch))
        .route("/channels/:channel_id/subscribe", post(http_subscribe))
        .route("/channels/:channel_id/unsubscribe", post(http_unsubscribe))
        .route("/channels/:channel_id/mute", post(http_mute))
        .route("/channels/:channel_id/unmute", post(http_unmute))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok("ok")
}

/// Request/response ingestion for trusted first-party producers (operator
/// tooling, the trigger engine). Same pipeline as the realtime path, minus
/// a submitting connection to exclude from the broadcast.
async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ApiError>)> {
    let message = submit_message(&state.api, None, req.message)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(e)))?;
    Ok(Json(SubmitResponse { message }))
}

async fn http_delta_fetch(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(q): Query<DeltaQuery>,
) -> Result<Json<Vec<Message>>, (StatusCode, Json<ApiError>)> {
    let messages = messages_after(&state.api, &ChannelId(channel_id), q.after)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(e)))?;
    Ok(Json(messages))
}

async fn register_push_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterPushTokenRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    if req.token.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::validation("userId and token are required")),
        ));
    }
    state
        .api
        .storage
        .register_push_endpoint(&req.user_id, &req.token)
        .await
        .map_err(internal)?;
    info!(user_id = %req.user_id, "registered push token");
    Ok(StatusCode::NO_CONTENT)
}

/// Logout path: drops a single device token, leaving the user's other
/// devices registered.
async fn unregister_push_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterPushTokenRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .api
        .storage
        .unregister_push_endpoint(&req.user_id, &req.token)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_channel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateChannelRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    if req.description.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::validation("channel description cannot be empty")),
        ));
    }
    state
        .api
        .storage
        .upsert_channel(&req.channel_id, &req.description)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_subscribe(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(q): Query<MembershipQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .api
        .storage
        .subscribe(&q.user_id, &ChannelId(channel_id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_unsubscribe(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(q): Query<MembershipQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .api
        .storage
        .unsubscribe(&q.user_id, &ChannelId(channel_id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_mute(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(q): Query<MembershipQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    set_muted(&state, &q.user_id, ChannelId(channel_id), true).await
}

async fn http_unmute(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(q): Query<MembershipQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    set_muted(&state, &q.user_id, ChannelId(channel_id), false).await
}

async fn set_muted(
    state: &Arc<AppState>,
    user_id: &UserId,
    channel_id: ChannelId,
    muted: bool,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .api
        .storage
        .set_muted(user_id, &channel_id, muted)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::ws_connection(state, socket))
}

fn internal(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::internal(err.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<AppState>) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let api = ApiContext {
            storage,
            rooms: Arc::new(RoomRegistry::new()),
            push: Arc::new(DisabledPushGateway),
        };
        let state = Arc::new(AppState { api });
        (build_router(state.clone()), state)
    }

    #[tokio::test]
    async fn producer_submit_then_delta_fetch_roundtrip() {
        let (app, _) = test_app().await;

        let body = serde_json::json!({
            "message": {
                "channel_id": "c1",
                "sender": { "id": "trigger-engine" },
                "text": "scheduled announcement"
            }
        });
        let submit = Request::post("/api/send-message")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = app.clone().oneshot(submit).await.expect("submit response");
        assert_eq!(response.status(), StatusCode::OK);

        let fetch = Request::get("/channels/c1/messages?after=1970-01-01T00:00:00Z")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(fetch).await.expect("fetch response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let messages: Vec<Message> = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text.as_deref(), Some("scheduled announcement"));
    }

    #[tokio::test]
    async fn submit_without_body_is_rejected() {
        let (app, _) = test_app().await;

        let body = serde_json::json!({
            "message": {
                "channel_id": "c1",
                "sender": { "id": "alice" }
            }
        });
        let submit = Request::post("/api/send-message")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = app.oneshot(submit).await.expect("submit response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_push_token_requires_token() {
        let (app, _) = test_app().await;

        let body = serde_json::json!({ "user_id": "alice", "token": "" });
        let request = Request::post("/api/register-push-token")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mute_endpoint_updates_membership_directory() {
        let (app, state) = test_app().await;

        let request = Request::post("/channels/c1/mute?user_id=bob")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let muted = state
            .api
            .storage
            .is_muted(&UserId::from("bob"), &ChannelId::from("c1"))
            .await
            .expect("is_muted");
        assert!(muted);
    }
}
