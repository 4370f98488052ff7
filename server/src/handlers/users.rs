//! User directory handlers

use aether_core::{ApiResponse, UpdateProfileRequest, UserProfile};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;

use crate::{
    crypto,
    error::{AppError, Result},
    AppState,
};

use super::AuthUser;

#[derive(Debug, Deserialize)]
pub struct UserSearch {
    pub search: Option<String>,
}

/// Everyone except the caller, optionally filtered by name
pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Query(params), _): WithRejection<Query<UserSearch>, AppError>,
) -> Result<Json<ApiResponse<Vec<UserProfile>>>> {
    let users = state
        .storage
        .list_users(&auth.id, params.search.as_deref())
        .await?;

    Ok(Json(ApiResponse::ok(
        users.into_iter().map(UserProfile::from).collect(),
    )))
}

/// Another user's profile by ID
pub async fn get_user(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<String>,
) -> Result<Json<ApiResponse<UserProfile>>> {
    let user = state
        .storage
        .get_user(&user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    Ok(Json(ApiResponse::ok(user.into())))
}

/// Update the caller's profile
pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Json(mut req), _): WithRejection<Json<UpdateProfileRequest>, AppError>,
) -> Result<Json<ApiResponse<UserProfile>>> {
    if let Some(username) = req.username.as_mut() {
        *username = username.trim().to_string();
        if !(3..=20).contains(&username.chars().count())
            || !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AppError::Validation(
                "Username must be 3-20 letters, digits or underscores".to_string(),
            ));
        }
        if state.storage.username_taken(username, Some(&auth.id)).await? {
            return Err(AppError::Conflict("Username is already taken".to_string()));
        }
    }

    state.storage.update_user_profile(&auth.id, &req).await?;

    let user = state
        .storage
        .get_user(&auth.id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    Ok(Json(
        ApiResponse::ok(user.into()).with_message("Profile updated successfully"),
    ))
}

/// Delete the caller's account and revoke the token used for the request
pub async fn delete_account(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ApiResponse<()>>> {
    if !state.storage.delete_user(&auth.id).await? {
        return Err(AppError::NotFound("User not found".to_string()));
    }

    state
        .storage
        .revoke_token(&crypto::hash_token(&auth.token), auth.expires_at)
        .await?;

    tracing::info!("User {} deleted their account", auth.id);

    Ok(Json(ApiResponse::message_only("Account deleted successfully")))
}
