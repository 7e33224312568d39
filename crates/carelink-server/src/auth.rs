//! Bearer-token authentication shared by the HTTP API and the socket gateway.

use axum::http::{header, HeaderMap};
use carelink_types::{UserIdentity, UserRole};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the cookie browsers send the access token in.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// Who a request or connection acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub identity: UserIdentity,
    pub role: UserRole,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid or expired token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("invalid token claims: {0}")]
    InvalidClaims(String),
}

/// Resolves a raw credential to a user.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userType")]
    pub user_type: String,
    /// Expiration (Unix timestamp).
    pub exp: i64,
}

/// Validates HS256 access tokens signed with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, credential: &str) -> Result<AuthenticatedUser, AuthError> {
        if credential.trim().is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let claims = decode::<AccessClaims>(credential, &self.key, &self.validation)?.claims;
        if claims.user_id.is_empty() {
            return Err(AuthError::InvalidClaims("empty userId".to_string()));
        }
        let role = claims
            .user_type
            .parse::<UserRole>()
            .map_err(|e| AuthError::InvalidClaims(e.to_string()))?;

        Ok(AuthenticatedUser {
            identity: UserIdentity::from(claims.user_id),
            role,
        })
    }
}

/// Finds the access token in request headers.
///
/// Looks at `Authorization` first (`Bearer <token>` or the bare token),
/// then the `access_token` cookie.
pub fn credential_from_headers(headers: &HeaderMap) -> Option<String> {
    let from_authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .filter(|token| !token.is_empty());
    if let Some(token) = from_authorization {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == ACCESS_TOKEN_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
