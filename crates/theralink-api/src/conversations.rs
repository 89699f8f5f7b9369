use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use theralink_types::api::{
    Claims, ConversationReadResponse, ConversationSummary, CreateConversationRequest,
};
use theralink_types::events::GatewayEvent;
use theralink_types::models::Conversation;

use crate::error::ApiError;
use crate::{AppState, run_db};

/// Find the conversation for the caller plus `participant_ids`, or create it.
/// Replies 201 on creation and 200 when it already existed.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let creator = claims.sub;
    let (conversation, created) = run_db(&state, move |db| {
        db.find_or_create_conversation(creator, &req.participant_ids)
    })
    .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let user = claims.sub;
    let list = run_db(&state, move |db| db.list_conversations_for_user(user)).await?;
    Ok(Json(list))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Conversation>, ApiError> {
    let viewer = claims.sub;
    let conversation = run_db(&state, move |db| db.get_conversation(conversation_id, viewer)).await?;
    Ok(Json(conversation))
}

/// Delete a conversation and everything in it, then tell each former
/// participant on their own connections.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    let requester = claims.sub;
    let participants =
        run_db(&state, move |db| db.delete_conversation(conversation_id, requester)).await?;

    info!("{} deleted conversation {}", requester, conversation_id);
    for user_id in participants {
        state
            .dispatcher
            .send_to_user(user_id, GatewayEvent::ConversationDeleted { conversation_id })
            .await;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Mark everything the caller received in the conversation as read.
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ConversationReadResponse>, ApiError> {
    let viewer = claims.sub;
    let message_ids =
        run_db(&state, move |db| db.mark_conversation_read(conversation_id, viewer)).await?;

    for &message_id in &message_ids {
        state.dispatcher.broadcast(GatewayEvent::MessageStatus {
            conversation_id,
            message_id,
            delivered: true,
            read: true,
        });
    }

    Ok(Json(ConversationReadResponse {
        conversation_id,
        message_ids,
    }))
}
