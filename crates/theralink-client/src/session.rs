use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use theralink_types::events::{GatewayCommand, GatewayEvent};
use theralink_types::models::UserId;

use crate::error::{ClientError, Result};
use crate::presence::{PresenceEvent, PresenceSnapshot, PresenceTracker};
use crate::view::Receipt;

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live gateway connection.
///
/// Events arrive on the receiver returned by [`RealtimeSession::connect`].
/// Presence is reduced internally and published through [`Self::presence`].
/// Dropping the session cancels its background task.
pub struct RealtimeSession {
    user_id: UserId,
    commands: mpsc::UnboundedSender<GatewayCommand>,
    presence: watch::Receiver<PresenceSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RealtimeSession {
    /// Connect, identify and wait for `ready`.
    pub async fn connect(
        url: &str,
        token: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GatewayEvent>)> {
        let (socket, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, mut stream) = socket.split();

        let mut tracker = PresenceTracker::new();
        tracker.set_connecting();

        send_command(
            &mut sink,
            &GatewayCommand::Identify {
                token: token.to_string(),
            },
        )
        .await?;

        let user_id = tokio::time::timeout(IDENTIFY_TIMEOUT, wait_for_ready(&mut stream))
            .await
            .map_err(|_| ClientError::Transport("timed out waiting for ready".into()))??;
        info!("Gateway session ready for {}", user_id);

        let presence = tracker.watch();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_session(
            sink,
            stream,
            tracker,
            cmd_rx,
            event_tx,
            cancel.clone(),
        ));

        Ok((
            Self {
                user_id,
                commands: cmd_tx,
                presence,
                cancel,
                task: Some(task),
            },
            event_rx,
        ))
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn presence(&self) -> watch::Receiver<PresenceSnapshot> {
        self.presence.clone()
    }

    pub fn send(&self, cmd: GatewayCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| ClientError::Transport("gateway session closed".into()))
    }

    /// Replace the conversations this session receives events for. Presence
    /// tracking starts on the first acknowledgement.
    pub fn subscribe(&self, conversation_ids: Vec<Uuid>) -> Result<()> {
        self.send(GatewayCommand::Subscribe { conversation_ids })
    }

    pub fn typing_start(&self, conversation_id: Uuid) -> Result<()> {
        self.send(GatewayCommand::TypingStart { conversation_id })
    }

    pub fn typing_stop(&self, conversation_id: Uuid) -> Result<()> {
        self.send(GatewayCommand::TypingStop { conversation_id })
    }

    pub fn send_receipt(&self, receipt: Receipt) -> Result<()> {
        self.send(match receipt {
            Receipt::Delivered(message_id) => GatewayCommand::MarkDelivered { message_id },
            Receipt::Read(message_id) => GatewayCommand::MarkRead { message_id },
        })
    }

    /// Close the socket and wait for the background task to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_for_ready(stream: &mut SplitStream<Socket>) -> Result<UserId> {
    while let Some(frame) = stream.next().await {
        if let WsMessage::Text(text) = frame? {
            if let Ok(GatewayEvent::Ready { user_id }) = serde_json::from_str(&text) {
                return Ok(user_id);
            }
        }
    }
    Err(ClientError::Transport("gateway closed before ready".into()))
}

async fn send_command(sink: &mut SplitSink<Socket, WsMessage>, cmd: &GatewayCommand) -> Result<()> {
    let text = serde_json::to_string(cmd)?;
    sink.send(WsMessage::text(text)).await?;
    Ok(())
}

async fn run_session(
    mut sink: SplitSink<Socket, WsMessage>,
    mut stream: SplitStream<Socket>,
    mut tracker: PresenceTracker,
    mut commands: mpsc::UnboundedReceiver<GatewayCommand>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                if let Err(e) = send_command(&mut sink, &cmd).await {
                    warn!("Gateway send failed: {}", e);
                    break;
                }
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Gateway connection error: {}", e);
                        break;
                    }
                };

                let event: GatewayEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Undecodable gateway event: {}", e);
                        continue;
                    }
                };

                if matches!(event, GatewayEvent::Subscribed { .. }) && tracker.set_subscribed() {
                    let track = GatewayCommand::Track { at: chrono::Utc::now() };
                    if send_command(&mut sink, &track).await.is_err() {
                        break;
                    }
                }
                if let Some(presence) = PresenceEvent::from_gateway(&event) {
                    tracker.apply(presence);
                }

                if events.send(event).is_err() {
                    debug!("Gateway event receiver dropped");
                }
            }
        }
    }

    tracker.disconnect();
    info!("Gateway session closed");
}
