use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use theralink_types::api::{
    ConversationReadResponse, ConversationSummary, CreateConversationRequest, ErrorBody,
    MessageQuery, MessageResponse, MessageStatusResponse, PageCursor, ReactionRequest,
    ReactionResponse, SendMessageRequest, UpsertProfileRequest,
};
use theralink_types::models::{Conversation, ProfileSummary};

use crate::error::{ClientError, Result};
use crate::view::{ConversationView, ReactionAction};

/// Authenticated access to the REST surface.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, token)
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Response> {
        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let message = match res.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
        };
        debug!("Request failed with {}: {}", status, message);
        Err(ClientError::from_status(status, message))
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        Ok(self.execute(req).await?.json().await?)
    }

    // -- Profiles --

    pub async fn upsert_profile(
        &self,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<ProfileSummary> {
        let body = UpsertProfileRequest {
            display_name: display_name.to_string(),
            avatar_url: avatar_url.map(str::to_string),
        };
        self.json(self.request(Method::PUT, "/profiles/me").json(&body))
            .await
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<ProfileSummary> {
        self.json(self.request(Method::GET, &format!("/profiles/{}", user_id)))
            .await
    }

    // -- Conversations --

    /// Find or create the conversation with `participant_ids`. The boolean is
    /// `true` when the server created it.
    pub async fn create_conversation(&self, participant_ids: &[Uuid]) -> Result<(Conversation, bool)> {
        let body = CreateConversationRequest {
            participant_ids: participant_ids.to_vec(),
        };
        let res = self
            .execute(self.request(Method::POST, "/conversations").json(&body))
            .await?;
        let created = res.status() == StatusCode::CREATED;
        Ok((res.json().await?, created))
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.json(self.request(Method::GET, "/conversations")).await
    }

    pub async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation> {
        self.json(self.request(Method::GET, &format!("/conversations/{}", conversation_id)))
            .await
    }

    pub async fn delete_conversation(&self, conversation_id: Uuid) -> Result<()> {
        self.execute(self.request(Method::DELETE, &format!("/conversations/{}", conversation_id)))
            .await?;
        Ok(())
    }

    pub async fn mark_conversation_read(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let res: ConversationReadResponse = self
            .json(self.request(Method::POST, &format!("/conversations/{}/read", conversation_id)))
            .await?;
        Ok(res.message_ids)
    }

    // -- Messages --

    /// One page of history in ascending order. Pass the cursor of the
    /// oldest message held to page backwards.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: Option<u32>,
        before: Option<PageCursor>,
    ) -> Result<Vec<MessageResponse>> {
        let query = MessageQuery::page(limit, before);
        self.json(
            self.request(Method::GET, &format!("/conversations/{}/messages", conversation_id))
                .query(&query),
        )
        .await
    }

    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        req: &SendMessageRequest,
    ) -> Result<MessageResponse> {
        self.json(
            self.request(Method::POST, &format!("/conversations/{}/messages", conversation_id))
                .json(req),
        )
        .await
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<()> {
        self.execute(self.request(Method::DELETE, &format!("/messages/{}", message_id)))
            .await?;
        Ok(())
    }

    pub async fn mark_delivered(&self, message_id: Uuid) -> Result<MessageStatusResponse> {
        self.json(self.request(Method::POST, &format!("/messages/{}/delivered", message_id)))
            .await
    }

    pub async fn mark_read(&self, message_id: Uuid) -> Result<MessageStatusResponse> {
        self.json(self.request(Method::POST, &format!("/messages/{}/read", message_id)))
            .await
    }

    // -- Reactions --

    pub async fn add_reaction(&self, message_id: Uuid, emoji: &str) -> Result<ReactionResponse> {
        let body = ReactionRequest {
            emoji: emoji.to_string(),
        };
        self.json(
            self.request(Method::PUT, &format!("/messages/{}/reactions", message_id))
                .json(&body),
        )
        .await
    }

    pub async fn remove_reaction(&self, message_id: Uuid, emoji: &str) -> Result<ReactionResponse> {
        let body = ReactionRequest {
            emoji: emoji.to_string(),
        };
        self.json(
            self.request(Method::DELETE, &format!("/messages/{}/reactions", message_id))
                .json(&body),
        )
        .await
    }

    /// Flip the viewer's `emoji` on a message: removed if the view shows the
    /// viewer already reacted with it, added otherwise.
    pub async fn toggle_reaction(
        &self,
        view: &ConversationView,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<(ReactionAction, ReactionResponse)> {
        let action = view.toggle_reaction(message_id, emoji)?;
        let res = match action {
            ReactionAction::Add => self.add_reaction(message_id, emoji).await?,
            ReactionAction::Remove => self.remove_reaction(message_id, emoji).await?,
        };
        Ok((action, res))
    }
}
