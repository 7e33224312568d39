//! CareLink realtime server library logic.

pub mod api_chat;
pub mod api_notifications;
pub mod api_presence;
pub mod api_ws;
pub mod auth;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod middleware;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod store;

use auth::Authenticator;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use carelink_db::DbPool;
use config::RealtimeConfig;
use delivery::ChatDeliveryService;
use registry::ConnectionRegistry;
use router::MessageRouter;
use serde_json::{json, Value};
use std::sync::Arc;
use store::{MessageStore, SqliteMessageStore};
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Validates access tokens for the API and the socket gateway.
    pub authenticator: Arc<dyn Authenticator>,
    /// Live connections per user.
    pub registry: ConnectionRegistry,
    /// Persists and routes chat messages.
    pub delivery: Arc<ChatDeliveryService>,
    /// Realtime settings.
    pub realtime: RealtimeConfig,
}

impl AppState {
    /// Builds the state with the SQLite-backed message store.
    pub fn new(pool: DbPool, authenticator: Arc<dyn Authenticator>, realtime: RealtimeConfig) -> Self {
        let store = Arc::new(SqliteMessageStore::new(pool.clone()));
        Self::with_store(pool, authenticator, realtime, store)
    }

    /// Builds the state around a caller-supplied message store.
    pub fn with_store(
        pool: DbPool,
        authenticator: Arc<dyn Authenticator>,
        realtime: RealtimeConfig,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let registry = ConnectionRegistry::new(realtime.session_policy);
        let delivery = Arc::new(ChatDeliveryService::new(
            store,
            MessageRouter::new(registry.clone()),
            realtime.max_content_len,
        )
        .with_sender_policy(realtime.sender_policy));
        Self {
            pool,
            authenticator,
            registry,
            delivery,
            realtime,
        }
    }
}

/// Maximum request body size (1 MiB). Messages carry image keys, not images.
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online_users": state.registry.identity_count(),
        "connections": state.registry.connection_count(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/v1/chat/send-message",
            post(api_chat::send_message_handler),
        )
        .route("/api/v1/chat/chats", get(api_chat::list_chats_handler))
        .route(
            "/api/v1/chat/find-or-create",
            post(api_chat::find_or_create_chat_handler),
        )
        .route(
            "/api/v1/chat/{chatId}/messages",
            get(api_chat::get_messages_handler),
        )
        .route(
            "/api/v1/presence/{userId}",
            get(api_presence::get_presence_handler),
        )
        .route(
            "/api/v1/notifications",
            get(api_notifications::list_notifications_handler)
                .post(api_notifications::notify_handler),
        )
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
