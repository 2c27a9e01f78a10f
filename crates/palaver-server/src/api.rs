//! The HTTP surface: a thin transcoder between JSON routes and the core
//! service, plus the SSE delivery endpoint.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::Method;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use palaver_core::stream::{StreamConfig, StreamEvent};
use palaver_core::types::{
    ChatMessage, CreateRoomRequest, MarkAsReadRequest, MembershipRequest, RoomView,
    SendMessageRequest,
};
use palaver_core::ChatService;
use palaver_shared::RequestMetadata;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::sse_limit::SseLimiter;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub rate_limiter: RateLimiter,
    pub sse_limiter: SseLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/rooms", post(create_room).get(list_rooms))
        .route("/rooms/{room_id}", get(room_info))
        .route("/rooms/{room_id}/join", post(join_room))
        .route("/rooms/{room_id}/leave", post(leave_room))
        .route("/rooms/{room_id}/messages", post(send_message).get(get_messages))
        .route("/rooms/{room_id}/history", get(get_history))
        .route("/rooms/{room_id}/stream", get(stream_messages))
        .route("/rooms/{room_id}/read", post(mark_as_read))
        .route("/rooms/{room_id}/delivered", post(mark_as_delivered))
        .route("/rooms/{room_id}/unread", get(unread_count))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(
            crate::request_meta::request_metadata_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct RoomResponse {
    success: bool,
    message: String,
    room: RoomView,
}

#[derive(Serialize)]
struct RoomsResponse {
    success: bool,
    message: String,
    rooms: Vec<RoomView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    has_more: bool,
}

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
    chat_message: ChatMessage,
}

#[derive(Serialize)]
struct MessagesResponse {
    success: bool,
    message: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
    has_more: bool,
}

#[derive(Serialize)]
struct UnreadResponse {
    success: bool,
    message: String,
    count: u32,
}

#[derive(Deserialize)]
struct ListRoomsQuery {
    user_id: String,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct MessagesQuery {
    user_id: String,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn create_room(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<RoomResponse>, ApiError> {
    let room = state.service.create_room(req, &meta).await?;
    Ok(Json(RoomResponse {
        success: true,
        message: "room created".to_string(),
        room,
    }))
}

async fn room_info(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let room = state.service.get_room_info(&room_id, &meta).await?;
    Ok(Json(RoomResponse {
        success: true,
        message: "room fetched".to_string(),
        room,
    }))
}

async fn join_room(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let joined = state.service.join_room(&room_id, &req.user_id, &meta).await?;
    Ok(Json(StatusResponse {
        success: true,
        message: if joined {
            "joined room".to_string()
        } else {
            "user is already a member".to_string()
        },
    }))
}

async fn leave_room(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.service.leave_room(&room_id, &req.user_id, &meta).await?;
    Ok(Json(StatusResponse {
        success: true,
        message: "left room".to_string(),
    }))
}

async fn list_rooms(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Query(query): Query<ListRoomsQuery>,
) -> Result<Json<RoomsResponse>, ApiError> {
    let page = state
        .service
        .list_user_rooms(&query.user_id, query.limit, query.cursor.as_deref(), &meta)
        .await?;
    Ok(Json(RoomsResponse {
        success: true,
        message: "rooms fetched".to_string(),
        rooms: page.rooms,
        cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}

async fn send_message(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let chat_message = state.service.send_message(&room_id, req, &meta).await?;
    Ok(Json(MessageResponse {
        success: true,
        message: "message sent".to_string(),
        chat_message,
    }))
}

async fn get_messages(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let page = state
        .service
        .get_messages(
            &room_id,
            &query.user_id,
            query.limit,
            query.cursor.as_deref(),
            &meta,
        )
        .await?;
    Ok(Json(MessagesResponse {
        success: true,
        message: "messages fetched".to_string(),
        messages: page.messages,
        next_cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}

async fn get_history(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let page = state
        .service
        .get_history(&room_id, query.limit, query.cursor.as_deref(), &meta)
        .await?;
    Ok(Json(MessagesResponse {
        success: true,
        message: "history fetched".to_string(),
        messages: page.messages,
        next_cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}

async fn mark_as_read(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Json(req): Json<MarkAsReadRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.service.mark_as_read(&room_id, req, &meta).await?;
    Ok(Json(StatusResponse {
        success: true,
        message: "marked as read".to_string(),
    }))
}

async fn mark_as_delivered(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Json(req): Json<MarkAsReadRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.service.mark_as_delivered(&room_id, req, &meta).await?;
    Ok(Json(StatusResponse {
        success: true,
        message: "marked as delivered".to_string(),
    }))
}

async fn unread_count(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UnreadResponse>, ApiError> {
    let count = state
        .service
        .unread_count(&room_id, &query.user_id, &meta)
        .await?;
    Ok(Json(UnreadResponse {
        success: true,
        message: "unread count fetched".to_string(),
        count,
    }))
}

/// Server-Sent Events delivery for a room stream.
///
/// Event names: `connected` once on open, `message` per delivered message,
/// `ping` on the heartbeat, and `error` carrying a fatal mid-stream failure
/// as the final event before the stream closes. Admission and validation
/// failures are plain HTTP errors before the stream starts.
async fn stream_messages(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMetadata>,
    Path(room_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Streams hold a connection for minutes; admission is stricter than the
    // request rate limit. Unresolvable addresses are not admission-limited.
    let permit = match meta.ip_address.parse::<IpAddr>() {
        Ok(ip) => Some(
            state
                .sse_limiter
                .admit(ip)
                .map_err(|e| ApiError::StreamRejected(e.to_string()))?,
        ),
        Err(_) => None,
    };

    let config = StreamConfig {
        heartbeat_interval: state.config.sse.heartbeat_interval,
        ..StreamConfig::default()
    };

    let rx = state
        .service
        .stream_messages(&room_id, &query.user_id, config, &meta)
        .await?;

    info!(
        room_id = %room_id,
        user_id = %query.user_id,
        request_id = %meta.request_id,
        "sse stream opened"
    );

    let connected = serde_json::json!({
        "room_id": room_id,
        "user_id": query.user_id,
    });
    let opening = tokio_stream::once(Ok::<Event, Infallible>(
        Event::default()
            .event("connected")
            .data(connected.to_string()),
    ));

    let events = ReceiverStream::new(rx).map(move |event| {
        // The permit lives as long as this stream.
        let _permit = &permit;
        Ok(match event {
            StreamEvent::Message(message) => {
                let payload = serde_json::to_string(&message).unwrap_or_else(|e| {
                    tracing::error!(error = %e, "failed to encode stream message");
                    String::from("{}")
                });
                Event::default().event("message").data(payload)
            }
            StreamEvent::Ping { timestamp } => {
                Event::default().event("ping").data(timestamp.to_string())
            }
            StreamEvent::Error { message } => {
                let payload = serde_json::json!({ "message": message }).to_string();
                Event::default().event("error").data(payload)
            }
        })
    });

    Ok(Sse::new(opening.chain(events)))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
