use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use theralink_db::Database;
use theralink_types::events::{GatewayCommand, GatewayEvent};

use crate::auth::decode_claims;
use crate::dispatcher::Dispatcher;

/// Liveness settings for gateway connections.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// The server sends a Ping this often.
    pub interval: Duration,
    /// Consecutive unanswered Pings before the connection is dropped.
    pub missed_limit: u8,
    /// How long a new socket may take to send `identify`.
    pub identify_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            missed_limit: 2,
            identify_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// Upper bound on how long an abruptly dropped client stays online for others.
    pub fn detection_window(&self) -> Duration {
        self.interval * (u32::from(self.missed_limit) + 1)
    }
}

/// Everything a connection needs from the server.
#[derive(Clone)]
pub struct GatewayContext {
    pub dispatcher: Dispatcher,
    pub db: Arc<Database>,
    pub jwt_secret: Arc<str>,
    pub heartbeat: HeartbeatConfig,
}

/// Per-connection state shared between the send and receive halves.
#[derive(Clone)]
pub struct ConnectionSession {
    pub user_id: Uuid,
    pub conn_id: Uuid,
    subscriptions: Arc<RwLock<HashSet<Uuid>>>,
}

impl ConnectionSession {
    pub fn new(user_id: Uuid, conn_id: Uuid) -> Self {
        Self {
            user_id,
            conn_id,
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn is_subscribed(&self, conversation_id: Uuid) -> bool {
        self.subscriptions
            .read()
            .map(|subs| subs.contains(&conversation_id))
            .unwrap_or(false)
    }

    fn replace_subscriptions(&self, ids: &[Uuid]) {
        if let Ok(mut subs) = self.subscriptions.write() {
            *subs = ids.iter().copied().collect();
        }
    }

    fn drop_subscription(&self, conversation_id: Uuid) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.remove(&conversation_id);
        }
    }
}

/// Handle a single WebSocket connection: identify, then relay events and
/// commands until either side goes away.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let user_id = match wait_for_identify(&mut receiver, &ctx).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} connected to gateway", user_id);

    // Step 2: Send Ready event
    if send_event(&mut sender, &GatewayEvent::Ready { user_id })
        .await
        .is_err()
    {
        return;
    }

    run_connection_loop(sender, receiver, ctx, user_id).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    ctx: GatewayContext,
    user_id: Uuid,
) {
    let (conn_id, mut user_rx) = ctx.dispatcher.register_connection(user_id).await;
    let session = ConnectionSession::new(user_id, conn_id);

    let mut broadcast_rx = ctx.dispatcher.subscribe();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let heartbeat = ctx.heartbeat;
    let send_session = session.clone();

    // Forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat.interval);
        ticker.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{} broadcast receiver lagged by {} events", send_session.user_id, n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if let Some(conversation_id) = msg.conversation_id {
                        if !send_session.is_subscribed(conversation_id) {
                            continue;
                        }
                    }

                    if sender.send(Message::Text(msg.json.to_string().into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let Some(event) = result else { break };

                    if let GatewayEvent::ConversationDeleted { conversation_id } = &event {
                        send_session.drop_subscription(*conversation_id);
                    }

                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= heartbeat.missed_limit {
                            warn!(
                                "{} heartbeat timeout (missed {} pongs), dropping connection",
                                send_session.user_id, missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_ctx = ctx.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_ctx, &recv_session, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            recv_session.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    ctx.dispatcher.disconnect(user_id, conn_id).await;
    info!("{} disconnected from gateway", user_id);
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    ctx: &GatewayContext,
) -> Option<Uuid> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return match decode_claims(&token, &ctx.jwt_secret) {
                        Ok(claims) => Some(claims.sub),
                        Err(e) => {
                            warn!("Gateway identify rejected: {}", e);
                            None
                        }
                    };
                }
            }
        }
        None
    };

    tokio::time::timeout(ctx.heartbeat.identify_timeout, identify)
        .await
        .ok()
        .flatten()
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text.into())).await,
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            Ok(())
        }
    }
}

/// Run a blocking store call off the async runtime.
async fn with_db<F, T>(db: &Arc<Database>, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&Database) -> theralink_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    let out = tokio::task::spawn_blocking(move || f(db.as_ref())).await??;
    Ok(out)
}

pub async fn handle_command(ctx: &GatewayContext, session: &ConnectionSession, cmd: GatewayCommand) {
    let user_id = session.user_id;

    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Track { at } => {
            debug!("{} tracking presence (client time {})", user_id, at);
            ctx.dispatcher.track(user_id, session.conn_id).await;
        }

        GatewayCommand::Subscribe { conversation_ids } => {
            let requested = conversation_ids.len();
            let allowed = match with_db(&ctx.db, move |db| {
                db.filter_participating(user_id, &conversation_ids)
            })
            .await
            {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!("{} subscribe failed: {}", user_id, e);
                    return;
                }
            };

            info!(
                "{} subscribing to {} of {} requested conversations",
                user_id,
                allowed.len(),
                requested
            );
            session.replace_subscriptions(&allowed);
            ctx.dispatcher
                .send_to_connection(
                    user_id,
                    session.conn_id,
                    GatewayEvent::Subscribed {
                        conversation_ids: allowed,
                    },
                )
                .await;
        }

        GatewayCommand::TypingStart { conversation_id } => {
            if session.is_subscribed(conversation_id) {
                ctx.dispatcher.broadcast(GatewayEvent::TypingStart {
                    conversation_id,
                    user_id,
                });
            } else {
                debug!("{} typing in unsubscribed conversation {}", user_id, conversation_id);
            }
        }

        GatewayCommand::TypingStop { conversation_id } => {
            if session.is_subscribed(conversation_id) {
                ctx.dispatcher.broadcast(GatewayEvent::TypingStop {
                    conversation_id,
                    user_id,
                });
            }
        }

        GatewayCommand::MarkDelivered { message_id } => {
            trace!("{} acknowledged delivery of {}", user_id, message_id);
            let result = with_db(&ctx.db, move |db| db.mark_delivered(message_id, user_id)).await;
            publish_status(ctx, user_id, result);
        }

        GatewayCommand::MarkRead { message_id } => {
            trace!("{} read {}", user_id, message_id);
            let result = with_db(&ctx.db, move |db| db.mark_read(message_id, user_id)).await;
            publish_status(ctx, user_id, result);
        }
    }
}

fn publish_status(
    ctx: &GatewayContext,
    user_id: Uuid,
    result: anyhow::Result<theralink_db::StatusChange>,
) {
    match result {
        Ok(change) if change.changed => {
            ctx.dispatcher.broadcast(GatewayEvent::MessageStatus {
                conversation_id: change.conversation_id,
                message_id: change.message_id,
                delivered: change.delivered,
                read: change.read,
            });
        }
        Ok(_) => {}
        Err(e) => warn!("{} status update failed: {}", user_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use theralink_types::models::MessageDraft;

    fn context() -> GatewayContext {
        GatewayContext {
            dispatcher: Dispatcher::default(),
            db: Arc::new(Database::open_in_memory().unwrap()),
            jwt_secret: Arc::from("test-secret"),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    #[tokio::test]
    async fn subscribe_keeps_only_own_conversations() {
        let ctx = context();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (ab, _) = ctx.db.find_or_create_conversation(a, &[b]).unwrap();
        let (bc, _) = ctx.db.find_or_create_conversation(b, &[c]).unwrap();

        let (conn_id, mut rx) = ctx.dispatcher.register_connection(a).await;
        let session = ConnectionSession::new(a, conn_id);
        handle_command(
            &ctx,
            &session,
            GatewayCommand::Subscribe {
                conversation_ids: vec![ab.id, bc.id],
            },
        )
        .await;

        assert!(session.is_subscribed(ab.id));
        assert!(!session.is_subscribed(bc.id));
        assert_eq!(
            rx.recv().await.unwrap(),
            GatewayEvent::Subscribed {
                conversation_ids: vec![ab.id]
            }
        );
    }

    #[tokio::test]
    async fn mark_read_broadcasts_once() {
        let ctx = context();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (conv, _) = ctx.db.find_or_create_conversation(a, &[b]).unwrap();
        let msg = ctx
            .db
            .append_message(conv.id, a, &MessageDraft::text("Hello"))
            .unwrap();

        let mut events = ctx.dispatcher.subscribe();
        let session = ConnectionSession::new(b, Uuid::new_v4());

        handle_command(&ctx, &session, GatewayCommand::MarkRead { message_id: msg.id }).await;
        handle_command(&ctx, &session, GatewayCommand::MarkRead { message_id: msg.id }).await;
        handle_command(&ctx, &session, GatewayCommand::MarkDelivered { message_id: msg.id }).await;

        let event: GatewayEvent = serde_json::from_str(&events.recv().await.unwrap().json).unwrap();
        assert_eq!(
            event,
            GatewayEvent::MessageStatus {
                conversation_id: conv.id,
                message_id: msg.id,
                delivered: true,
                read: true,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_requires_subscription() {
        let ctx = context();
        let mut events = ctx.dispatcher.subscribe();
        let session = ConnectionSession::new(Uuid::new_v4(), Uuid::new_v4());

        handle_command(
            &ctx,
            &session,
            GatewayCommand::TypingStart {
                conversation_id: Uuid::new_v4(),
            },
        )
        .await;

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn detection_window_covers_missed_pings() {
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.detection_window(), Duration::from_secs(45));
    }
}
