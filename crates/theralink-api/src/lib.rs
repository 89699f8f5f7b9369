pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod profiles;
pub mod reactions;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use theralink_db::Database;
use theralink_gateway::dispatcher::Dispatcher;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: Arc<str>,
}

/// All REST routes. Every route requires a bearer token.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/profiles/me", put(profiles::upsert_me))
        .route("/profiles/{user_id}", get(profiles::get_profile))
        .route(
            "/conversations",
            post(conversations::create_conversation).get(conversations::list_conversations),
        )
        .route(
            "/conversations/{conversation_id}",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(conversations::mark_conversation_read),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route(
            "/moderation/messages/{message_id}",
            delete(messages::moderate_delete_message),
        )
        .route("/messages/{message_id}/delivered", post(messages::mark_delivered))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route(
            "/messages/{message_id}/reactions",
            put(reactions::add_reaction).delete(reactions::remove_reaction),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}

/// Run blocking DB work off the async runtime.
pub(crate) async fn run_db<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> theralink_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    let out = tokio::task::spawn_blocking(move || f(db.as_ref())).await??;
    Ok(out)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;
    use uuid::Uuid;

    use theralink_db::Database;
    use theralink_gateway::dispatcher::Dispatcher;
    use theralink_types::api::Claims;

    use super::{AppState, AppStateInner, router};

    pub const SECRET: &str = "api-test-secret";

    pub struct TestApp {
        pub state: AppState,
        pub router: Router,
    }

    impl TestApp {
        pub fn new() -> Self {
            let state: AppState = Arc::new(AppStateInner {
                db: Arc::new(Database::open_in_memory().unwrap()),
                dispatcher: Dispatcher::default(),
                jwt_secret: Arc::from(SECRET),
            });
            Self {
                router: router(state.clone()),
                state,
            }
        }

        pub async fn call(
            &self,
            method: Method,
            uri: &str,
            user: Option<Uuid>,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, Vec<u8>) {
            self.call_with_token(method, uri, user.map(token), body).await
        }

        pub async fn call_with_token(
            &self,
            method: Method,
            uri: &str,
            token: Option<String>,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, Vec<u8>) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {}", token));
            }
            let req = match body {
                Some(json) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let res = self.router.clone().oneshot(req).await.unwrap();
            let status = res.status();
            let bytes = res.into_body().collect().await.unwrap().to_bytes();
            (status, bytes.to_vec())
        }

        pub async fn json<T: DeserializeOwned>(
            &self,
            method: Method,
            uri: &str,
            user: Uuid,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, T) {
            let (status, bytes) = self.call(method, uri, Some(user), body).await;
            let parsed = serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                panic!("{} {}: {}", status, String::from_utf8_lossy(&bytes), e)
            });
            (status, parsed)
        }
    }

    pub fn token(user: Uuid) -> String {
        token_with_role(user, None)
    }

    pub fn token_with_role(user: Uuid, role: Option<&str>) -> String {
        let claims = Claims {
            sub: user,
            email: None,
            role: role.map(str::to_string),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }
}
