use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, info};
use uuid::Uuid;

use theralink_db::{DeleteOutcome, StatusChange, StoreError};
use theralink_db::messages::DEFAULT_PAGE_SIZE;
use theralink_types::api::{
    Claims, MessageQuery, MessageResponse, MessageStatusResponse, SendMessageRequest,
};
use theralink_types::events::GatewayEvent;
use theralink_types::models::{MessageDraft, ProfileSummary, group_reactions};

use crate::error::ApiError;
use crate::{AppState, run_db};

/// Persist a message, then broadcast it to the conversation's subscribers.
/// The sender's own UI is updated from the broadcast like everyone else's.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender_id = claims.sub;
    let draft = MessageDraft {
        kind: req.kind,
        body: req.body,
        attachment: req.attachment,
    };

    let (message, sender) = run_db(&state, move |db| {
        let message = db.append_message(conversation_id, sender_id, &draft)?;
        let sender = db
            .get_profile(sender_id)?
            .unwrap_or_else(|| ProfileSummary::unknown(sender_id));
        Ok((message, sender))
    })
    .await?;

    let response = MessageResponse {
        message,
        sender,
        reactions: vec![],
        client_nonce: req.client_nonce,
    };
    state
        .dispatcher
        .broadcast(GatewayEvent::NewMessage(response.clone()));

    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let viewer = claims.sub;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let cursor = query.cursor();

    let (rows, reactions) = run_db(&state, move |db| {
        let rows = db.list_messages(conversation_id, viewer, limit, cursor)?;
        let ids: Vec<Uuid> = rows.iter().map(|(m, _)| m.id).collect();
        let reactions = db.reactions_for_messages(&ids)?;
        Ok((rows, reactions))
    })
    .await?;

    let mut grouped = group_reactions(&reactions);
    let messages = rows
        .into_iter()
        .map(|(message, sender)| MessageResponse {
            reactions: grouped.remove(&message.id).unwrap_or_default(),
            message,
            sender,
            client_nonce: None,
        })
        .collect();

    Ok(Json(messages))
}

/// Hard-delete one of the caller's own messages.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    let requester = claims.sub;
    let outcome = run_db(&state, move |db| db.delete_message(message_id, requester)).await?;
    publish_delete(&state, outcome);
    Ok(StatusCode::NO_CONTENT)
}

/// Hard-delete any message. Requires the `moderator` role claim.
pub async fn moderate_delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    if !claims.is_moderator() {
        return Err(StoreError::Forbidden("moderator role required".into()).into());
    }

    let outcome = run_db(&state, move |db| db.delete_message_as_moderator(message_id)).await?;
    info!("Moderator {} deleted message {}", claims.sub, message_id);
    publish_delete(&state, outcome);
    Ok(StatusCode::NO_CONTENT)
}

fn publish_delete(state: &AppState, outcome: DeleteOutcome) {
    state.dispatcher.broadcast(GatewayEvent::MessageDeleted {
        conversation_id: outcome.conversation_id,
        message_id: outcome.message_id,
    });
}

pub async fn mark_delivered(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MessageStatusResponse>, ApiError> {
    let viewer = claims.sub;
    let change = run_db(&state, move |db| db.mark_delivered(message_id, viewer)).await?;
    Ok(Json(publish_status(&state, change)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MessageStatusResponse>, ApiError> {
    let viewer = claims.sub;
    let change = run_db(&state, move |db| db.mark_read(message_id, viewer)).await?;
    Ok(Json(publish_status(&state, change)))
}

fn publish_status(state: &AppState, change: StatusChange) -> MessageStatusResponse {
    if change.changed {
        state.dispatcher.broadcast(GatewayEvent::MessageStatus {
            conversation_id: change.conversation_id,
            message_id: change.message_id,
            delivered: change.delivered,
            read: change.read,
        });
    } else {
        debug!("Status of {} already at {:?}", change.message_id, change.status());
    }

    MessageStatusResponse {
        message_id: change.message_id,
        delivered: change.delivered,
        read: change.read,
        changed: change.changed,
    }
}
