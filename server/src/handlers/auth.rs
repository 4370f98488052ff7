//! Authentication handlers

use aether_core::{
    ApiResponse, AuthTokens, LoginRequest, RefreshTokenRequest, RegisterRequest, UserProfile,
};
use axum::{extract::State, http::StatusCode, Json};
use axum_extra::extract::WithRejection;

use crate::{
    crypto::{self, TokenSubject, TokenType},
    error::{AppError, Result},
    models::{NewUser, UserRow},
    AppState,
};

use super::AuthUser;

const MIN_PASSWORD_LENGTH: usize = 6;

/// Register a new account and sign it in
pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<RegisterRequest>, AppError>,
) -> Result<(StatusCode, Json<ApiResponse<AuthTokens>>)> {
    let email = req.email.trim().to_lowercase();
    let username = req.username.trim();
    validate_registration(&email, username, &req.password)?;

    if state.storage.get_user_by_email(&email).await?.is_some()
        || state.storage.username_taken(username, None).await?
    {
        return Err(AppError::Validation(
            "User with this email or username already exists".to_string(),
        ));
    }

    let password = req.password.clone();
    let password_hash = tokio::task::spawn_blocking(move || crypto::hash_password(&password))
        .await
        .map_err(anyhow::Error::from)??;
    let user = state
        .storage
        .create_user(&NewUser {
            email: &email,
            username,
            first_name: req.first_name.trim(),
            last_name: req.last_name.trim(),
            password_hash: &password_hash,
        })
        .await?;

    tracing::info!("User {} registered as {}", user.id, user.username);

    let tokens = issue_tokens(&state, user)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(tokens).with_message("User registered successfully")),
    ))
}

/// Login with email and password
pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<LoginRequest>, AppError>,
) -> Result<Json<ApiResponse<AuthTokens>>> {
    let invalid = || AppError::Authentication("Invalid email or password".to_string());

    let user = state
        .storage
        .get_user_by_email(req.email.trim())
        .await?
        .ok_or_else(invalid)?;

    let password = req.password;
    let stored = user.password_hash.clone();
    let matches = tokio::task::spawn_blocking(move || crypto::verify_password(&password, &stored))
        .await
        .map_err(anyhow::Error::from)?;
    if !matches {
        return Err(invalid());
    }

    tracing::info!("User {} logged in", user.id);

    let tokens = issue_tokens(&state, user)?;
    Ok(Json(ApiResponse::ok(tokens).with_message("Login successful")))
}

/// Exchange a refresh token for a new token pair; the old one is revoked
pub async fn refresh_token(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<RefreshTokenRequest>, AppError>,
) -> Result<Json<ApiResponse<AuthTokens>>> {
    let invalid = || AppError::Authentication("Invalid refresh token".to_string());

    let claims = state
        .jwt
        .verify(&req.refresh_token, TokenType::Refresh)
        .ok_or_else(invalid)?;

    let token_hash = crypto::hash_token(&req.refresh_token);
    if state.storage.is_token_revoked(&token_hash).await? {
        return Err(invalid());
    }

    let user = state.storage.get_user(&claims.sub).await?.ok_or_else(invalid)?;

    state.storage.revoke_token(&token_hash, claims.exp).await?;

    let tokens = issue_tokens(&state, user)?;
    Ok(Json(ApiResponse::ok(tokens)))
}

/// Logout by revoking the presented access token
pub async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ApiResponse<()>>> {
    state
        .storage
        .revoke_token(&crypto::hash_token(&auth.token), auth.expires_at)
        .await?;

    tracing::info!("User {} logged out", auth.id);

    Ok(Json(ApiResponse::message_only("Logged out successfully")))
}

/// Profile of the signed-in user
pub async fn profile(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ApiResponse<UserProfile>>> {
    let user = state
        .storage
        .get_user(&auth.id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    Ok(Json(ApiResponse::ok(user.into())))
}

fn issue_tokens(state: &AppState, user: UserRow) -> Result<AuthTokens> {
    let subject = TokenSubject {
        id: &user.id,
        email: &user.email,
        username: &user.username,
    };
    let access = state.jwt.issue(&subject, TokenType::Access)?;
    let refresh = state.jwt.issue(&subject, TokenType::Refresh)?;

    Ok(AuthTokens {
        token: access.token,
        refresh_token: refresh.token,
        expires_in: state.jwt.access_ttl_secs(),
        user: user.into(),
    })
}

fn validate_registration(email: &str, username: &str, password: &str) -> Result<()> {
    let valid_email = email
        .split_once('@')
        .map(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        })
        .unwrap_or(false);
    if !valid_email {
        return Err(AppError::Validation("A valid email is required".to_string()));
    }

    let valid_username = (3..=20).contains(&username.chars().count())
        && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_username {
        return Err(AppError::Validation(
            "Username must be 3-20 letters, digits or underscores".to_string(),
        ));
    }

    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AppError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}
