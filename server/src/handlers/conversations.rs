//! Conversation and group handlers

use std::collections::BTreeSet;

use aether_core::{
    ApiResponse, ContainerKind, Conversation, CreateConversationRequest, CreateGroupRequest,
};
use axum::{extract::State, http::StatusCode, Json};
use axum_extra::extract::WithRejection;

use crate::{
    error::{AppError, Result},
    models::ContainerRow,
    AppState,
};

use super::AuthUser;

/// Open (or reuse) the direct conversation with another user
pub async fn create_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Json(req), _): WithRejection<Json<CreateConversationRequest>, AppError>,
) -> Result<(StatusCode, Json<ApiResponse<Conversation>>)> {
    let participant_id = req.participant_id.trim();
    if participant_id.is_empty() || participant_id == auth.id {
        return Err(AppError::Validation(
            "participantId must name another user".to_string(),
        ));
    }

    if state.storage.get_user(participant_id).await?.is_none() {
        return Err(AppError::NotFound("User not found".to_string()));
    }

    if let Some(existing) = state
        .storage
        .find_direct_conversation(&auth.id, participant_id)
        .await?
    {
        let conversation = with_participants(&state, existing).await?;
        return Ok((StatusCode::OK, Json(ApiResponse::ok(conversation))));
    }

    let participants = vec![auth.id.clone(), participant_id.to_string()];
    let row = state
        .storage
        .create_container(ContainerKind::Direct, None, &auth.id, &participants)
        .await?;

    tracing::info!("Conversation {} opened by {}", row.id, auth.id);

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(row.into_conversation(participants))),
    ))
}

/// Create a group; the creator is always a member
pub async fn create_group(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Json(req), _): WithRejection<Json<CreateGroupRequest>, AppError>,
) -> Result<(StatusCode, Json<ApiResponse<Conversation>>)> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Group name is required".to_string()));
    }

    let members: BTreeSet<String> = req
        .member_ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .chain(std::iter::once(auth.id.clone()))
        .collect();
    let members: Vec<String> = members.into_iter().collect();

    if state.storage.count_existing_users(&members).await? != members.len() {
        return Err(AppError::NotFound("One or more members not found".to_string()));
    }

    let row = state
        .storage
        .create_container(ContainerKind::Group, Some(name), &auth.id, &members)
        .await?;

    tracing::info!("Group {} created by {} with {} members", row.id, auth.id, members.len());

    let group = with_participants(&state, row).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(group))))
}

/// Conversations and groups the caller participates in
pub async fn list_conversations(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ApiResponse<Vec<Conversation>>>> {
    let rows = state.storage.list_user_containers(&auth.id).await?;

    let mut conversations = Vec::with_capacity(rows.len());
    for row in rows {
        conversations.push(with_participants(&state, row).await?);
    }

    Ok(Json(ApiResponse::ok(conversations)))
}

async fn with_participants(state: &AppState, row: ContainerRow) -> Result<Conversation> {
    let participants = state.storage.list_participants(&row.id).await?;
    Ok(row.into_conversation(participants))
}
