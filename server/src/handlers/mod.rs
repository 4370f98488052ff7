//! HTTP request handlers for Aether Server

pub mod auth;
pub mod conversations;
pub mod health;
pub mod messages;
pub mod users;

use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::{
    crypto::{self, Claims, TokenType},
    error::AppError,
    AppState,
};

/// Authenticated user context extracted from a bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub username: String,
    /// The raw token, kept so logout can revoke it
    pub token: String,
    pub expires_at: i64,
}

impl AuthUser {
    fn from_claims(claims: Claims, token: String) -> Self {
        Self {
            id: claims.sub,
            email: claims.email,
            username: claims.username,
            token,
            expires_at: claims.exp,
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthenticated())?;
        let token = bearer.token();

        let claims = state
            .jwt
            .verify(token, TokenType::Access)
            .ok_or_else(|| AppError::Authentication("Invalid or expired token".to_string()))?;

        if state.storage.is_token_revoked(&crypto::hash_token(token)).await? {
            return Err(AppError::Authentication("Token has been revoked".to_string()));
        }

        Ok(AuthUser::from_claims(claims, token.to_string()))
    }
}
