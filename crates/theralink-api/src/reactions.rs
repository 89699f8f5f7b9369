use axum::{
    Extension, Json,
    extract::{Path, State},
};
use uuid::Uuid;

use theralink_types::api::{Claims, ReactionRequest, ReactionResponse};
use theralink_types::events::GatewayEvent;

use crate::error::ApiError;
use crate::{AppState, run_db};

pub async fn add_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<ReactionResponse>, ApiError> {
    let user_id = claims.sub;
    let emoji = req.emoji.trim().to_string();
    let stored = emoji.clone();
    let change = run_db(&state, move |db| db.add_reaction(message_id, user_id, &stored)).await?;

    if change.changed {
        state.dispatcher.broadcast(GatewayEvent::ReactionAdd {
            conversation_id: change.conversation_id,
            message_id,
            user_id,
            emoji: emoji.clone(),
        });
    }

    Ok(Json(ReactionResponse {
        message_id,
        emoji,
        changed: change.changed,
    }))
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<ReactionResponse>, ApiError> {
    let user_id = claims.sub;
    let emoji = req.emoji.trim().to_string();
    let stored = emoji.clone();
    let change =
        run_db(&state, move |db| db.remove_reaction(message_id, user_id, &stored)).await?;

    if change.changed {
        state.dispatcher.broadcast(GatewayEvent::ReactionRemove {
            conversation_id: change.conversation_id,
            message_id,
            user_id,
            emoji: emoji.clone(),
        });
    }

    Ok(Json(ReactionResponse {
        message_id,
        emoji,
        changed: change.changed,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use super::*;
    use crate::testing::TestApp;
    use theralink_types::models::MessageDraft;

    #[tokio::test]
    async fn duplicate_add_broadcasts_once() {
        let app = TestApp::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (conv, _) = app.state.db.find_or_create_conversation(a, &[b]).unwrap();
        let msg = app.state.db.append_message(conv.id, a, &MessageDraft::text("hi")).unwrap();
        let mut events = app.state.dispatcher.subscribe();
        let uri = format!("/messages/{}/reactions", msg.id);

        let (status, first): (_, ReactionResponse) = app
            .json(Method::PUT, &uri, b, Some(json!({ "emoji": "👍" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(first.changed);

        let (_, second): (_, ReactionResponse) = app
            .json(Method::PUT, &uri, b, Some(json!({ "emoji": "👍" })))
            .await;
        assert!(!second.changed);

        let event: GatewayEvent = serde_json::from_str(&events.try_recv().unwrap().json).unwrap();
        assert_eq!(
            event,
            GatewayEvent::ReactionAdd {
                conversation_id: conv.id,
                message_id: msg.id,
                user_id: b,
                emoji: "👍".into()
            }
        );
        assert!(events.try_recv().is_err());

        let (_, removed): (_, ReactionResponse) = app
            .json(Method::DELETE, &uri, b, Some(json!({ "emoji": "👍" })))
            .await;
        assert!(removed.changed);
        let event: GatewayEvent = serde_json::from_str(&events.try_recv().unwrap().json).unwrap();
        assert!(matches!(event, GatewayEvent::ReactionRemove { .. }));
    }

    #[tokio::test]
    async fn oversized_emoji_is_400() {
        let app = TestApp::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (conv, _) = app.state.db.find_or_create_conversation(a, &[b]).unwrap();
        let msg = app.state.db.append_message(conv.id, a, &MessageDraft::text("hi")).unwrap();

        let (status, _) = app
            .call(
                Method::PUT,
                &format!("/messages/{}/reactions", msg.id),
                Some(a),
                Some(json!({ "emoji": "x".repeat(40) })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
