//! Shared fixtures for server integration tests.
#![allow(dead_code)]

use carelink_server::auth::{AccessClaims, JwtAuthenticator};
use carelink_server::config::RealtimeConfig;
use carelink_server::registry::SessionPolicy;
use carelink_server::{app, AppState};
use carelink_types::UserRole;
use jsonwebtoken::{encode, EncodingKey, Header};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;

pub const SECRET: &[u8] = b"integration-test-secret";

/// Signs a one-hour access token.
pub fn token(user_id: &str, role: UserRole) -> String {
    let claims = AccessClaims {
        user_id: user_id.to_string(),
        user_type: role.as_str().to_string(),
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET))
        .expect("failed to sign token")
}

/// App state over a migrated temporary database. Keep the returned file
/// alive for as long as the state is used.
pub fn test_state(realtime: RealtimeConfig) -> (AppState, NamedTempFile) {
    let file = NamedTempFile::new().expect("failed to create temp db");
    let path = file.path().to_str().expect("temp path is utf-8").to_string();
    let pool = carelink_db::create_pool(&path, carelink_db::PoolSettings::default())
        .expect("failed to create pool");
    {
        let conn = pool.get().expect("failed to get connection");
        carelink_db::run_migrations(&conn).expect("failed to run migrations");
    }

    let state = AppState::new(pool, Arc::new(JwtAuthenticator::new(SECRET)), realtime);
    (state, file)
}

pub fn realtime(policy: SessionPolicy) -> RealtimeConfig {
    RealtimeConfig {
        session_policy: policy,
        ..RealtimeConfig::default()
    }
}

/// Creates a chat with the given participants.
pub fn seed_chat(state: &AppState, chat_id: &str, participants: &[(&str, UserRole)]) {
    let conn = state.pool.get().expect("failed to get connection");
    carelink_chat::create_chat(&conn, chat_id).expect("failed to create chat");
    for (user, role) in participants {
        carelink_chat::add_participant(&conn, chat_id, user, *role)
            .expect("failed to add participant");
    }
}

/// Serves the app on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(state);

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

/// Polls `condition` for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
