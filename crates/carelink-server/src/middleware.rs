use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::{credential_from_headers, AuthenticatedUser};
use crate::AppState;

/// Wrapper for the authenticated user stored in request extensions.
#[derive(Clone, Debug)]
pub struct IdentityContext(pub AuthenticatedUser);

/// Middleware to authenticate requests via `Authorization` or the
/// `access_token` cookie.
///
/// Any failure, including a missing token, is answered with `401` before
/// the handler runs.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let credential = credential_from_headers(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;

    let user = state.authenticator.authenticate(&credential).map_err(|e| {
        tracing::debug!(path = %req.uri().path(), "request authentication failed: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(IdentityContext(user));

    Ok(next.run(req).await)
}
