//! Message handlers

use aether_core::{
    ApiResponse, EditMessageRequest, Message, MessageQuery, ReactionRequest, ReactionSummary,
    ReadReceipt, SendMessageRequest, UnreadCount,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use axum_extra::extract::WithRejection;

use crate::{
    error::{AppError, Result},
    AppState,
};

use super::AuthUser;

type MessageId = WithRejection<Path<String>, AppError>;

/// A page of messages from one conversation or group
pub async fn get_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Query(query), _): WithRejection<Query<MessageQuery>, AppError>,
) -> Result<Json<ApiResponse<Vec<Message>>>> {
    let (messages, pagination) = state.messages.get_messages(&query, &auth.id).await?;
    Ok(Json(ApiResponse::paginated(messages, pagination)))
}

pub async fn send_message(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Json(req), _): WithRejection<Json<SendMessageRequest>, AppError>,
) -> Result<(StatusCode, Json<ApiResponse<Message>>)> {
    let message = state.messages.send_message(req, &auth.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(message).with_message("Message sent successfully")),
    ))
}

pub async fn edit_message(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Path(message_id), _): MessageId,
    WithRejection(Json(req), _): WithRejection<Json<EditMessageRequest>, AppError>,
) -> Result<Json<ApiResponse<Message>>> {
    let message = state
        .messages
        .edit_message(&message_id, &req.content, &auth.id)
        .await?;
    Ok(Json(
        ApiResponse::ok(message).with_message("Message updated successfully"),
    ))
}

pub async fn delete_message(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Path(message_id), _): MessageId,
) -> Result<Json<ApiResponse<()>>> {
    state.messages.delete_message(&message_id, &auth.id).await?;
    Ok(Json(ApiResponse::message_only("Message deleted successfully")))
}

pub async fn add_reaction(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Path(message_id), _): MessageId,
    WithRejection(Json(req), _): WithRejection<Json<ReactionRequest>, AppError>,
) -> Result<(StatusCode, Json<ApiResponse<ReactionSummary>>)> {
    let summary = state
        .messages
        .add_reaction(&message_id, &auth.id, &req.emoji)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(summary))))
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Path((message_id, emoji)), _): WithRejection<Path<(String, String)>, AppError>,
) -> Result<Json<ApiResponse<()>>> {
    state
        .messages
        .remove_reaction(&message_id, &auth.id, &emoji)
        .await?;
    Ok(Json(ApiResponse::message_only("Reaction removed successfully")))
}

pub async fn mark_as_read(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Path(message_id), _): MessageId,
) -> Result<Json<ApiResponse<ReadReceipt>>> {
    let receipt = state.messages.mark_as_read(&message_id, &auth.id).await?;
    Ok(Json(ApiResponse::ok(receipt)))
}

pub async fn pin_message(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Path(message_id), _): MessageId,
) -> Result<Json<ApiResponse<Message>>> {
    let message = state.messages.pin_message(&message_id, &auth.id).await?;
    Ok(Json(ApiResponse::ok(message)))
}

pub async fn unpin_message(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Path(message_id), _): MessageId,
) -> Result<Json<ApiResponse<Message>>> {
    let message = state.messages.unpin_message(&message_id, &auth.id).await?;
    Ok(Json(ApiResponse::ok(message)))
}

pub async fn unread_count(
    State(state): State<AppState>,
    auth: AuthUser,
    WithRejection(Query(query), _): WithRejection<Query<MessageQuery>, AppError>,
) -> Result<Json<ApiResponse<UnreadCount>>> {
    let unread_count = state.messages.unread_count(&query, &auth.id).await?;
    Ok(Json(ApiResponse::ok(UnreadCount { unread_count })))
}
