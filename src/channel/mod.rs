//! Control channel: the persistent duplex link to the remote service.
//!
//! The transport task owns the websocket. It authenticates with the first
//! frame after connect, maintains the `agent_connection` / `authentication`
//! rows in the state store, forwards every other inbound frame to the
//! message dispatcher, and drains the outbound queue, attaching the current
//! bearer token to each frame. Connection loss of any kind drops back to a
//! reconnect loop with a 2.5 second backoff.

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::AgentIdentity;
use crate::error::ChannelError;
use crate::model::Claims;
use crate::state::{AgentErrorKind, StateStore};

use protocol::{InboundFrame, OutboundFrame, OutboundMessage, decode_claims, size_in_mb};

const RECONNECT_BACKOFF: Duration = Duration::from_millis(2500);
const OUTBOUND_QUEUE: usize = 64;

/// Current authentication state, broadcast to the engine and handlers.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub token: Option<String>,
    pub claims: Claims,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

/// Cheap handle for sending messages and observing auth state.
#[derive(Clone)]
pub struct ChannelHandle {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    auth_rx: watch::Receiver<AuthState>,
}

impl ChannelHandle {
    pub async fn send(&self, message_type: &str, message_body: Value) -> Result<(), ChannelError> {
        self.outbound_tx
            .send(OutboundMessage {
                message_type: message_type.to_string(),
                message_body,
            })
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    pub async fn send_heartbeat(&self, agent_uuid: &str) -> Result<(), ChannelError> {
        self.send("heartbeat", serde_json::json!({"agent_uuid": agent_uuid}))
            .await
    }

    pub fn auth(&self) -> AuthState {
        self.auth_rx.borrow().clone()
    }
}

/// The transport task. Constructed paired with its [`ChannelHandle`].
pub struct ControlChannel {
    url: String,
    identity: AgentIdentity,
    store: Arc<StateStore>,
    outbound_rx: mpsc::Receiver<OutboundMessage>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    auth_tx: watch::Sender<AuthState>,
}

/// Build a channel; inbound frames (other than `auth`) are delivered on
/// `inbound_tx`.
pub fn control_channel(
    url: String,
    identity: AgentIdentity,
    store: Arc<StateStore>,
    inbound_tx: mpsc::Sender<InboundFrame>,
) -> (ControlChannel, ChannelHandle) {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (auth_tx, auth_rx) = watch::channel(AuthState::default());
    (
        ControlChannel {
            url,
            identity,
            store,
            outbound_rx,
            inbound_tx,
            auth_tx,
        },
        ChannelHandle {
            outbound_tx,
            auth_rx,
        },
    )
}

impl ControlChannel {
    /// Connect-serve-reconnect forever.
    pub async fn run(mut self) {
        loop {
            match connect_async(&self.url).await {
                Ok((ws, _response)) => {
                    tracing::info!(url = %self.url, "control channel connected");
                    if let Err(e) = self
                        .store
                        .set_agent_error(AgentErrorKind::AgentConnection, "Connected")
                        .await
                    {
                        tracing::warn!(error = %e, "failed to record connection status");
                    }

                    let reason = self.serve(ws).await;
                    tracing::warn!(?reason, "control channel dropped");
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "control channel connect failed");
                }
            }

            if let Err(e) = self
                .store
                .set_agent_error(AgentErrorKind::AgentConnection, "Not connected")
                .await
            {
                tracing::warn!(error = %e, "failed to record connection status");
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn serve(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<(), ChannelError> {
        let (mut write, mut read) = ws.split();

        // First frame after connect: the auth handshake.
        let handshake = serde_json::json!({
            "agent_uuid": self.identity.uuid,
            "key": self.identity.key,
        });
        write
            .send(Message::Text(handshake.to_string().into()))
            .await
            .map_err(|e| ChannelError::Disconnected(e.to_string()))?;

        loop {
            tokio::select! {
                queued = self.outbound_rx.recv() => {
                    let Some(message) = queued else {
                        return Err(ChannelError::Disconnected(
                            "outbound queue closed".to_string(),
                        ));
                    };
                    let frame = OutboundFrame {
                        token: self.auth_tx.borrow().token.clone(),
                        message_type: message.message_type,
                        message_body: message.message_body,
                    };
                    let text = serde_json::to_string(&frame)
                        .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
                    tracing::info!(
                        message_type = %frame.message_type,
                        size_mb = size_in_mb(&text),
                        "sending"
                    );
                    write
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|e| ChannelError::Disconnected(e.to_string()))?;
                }
                incoming = read.next() => {
                    match incoming {
                        None => return Err(ChannelError::Disconnected(
                            "stream ended".to_string(),
                        )),
                        Some(Err(e)) => {
                            return Err(ChannelError::Disconnected(e.to_string()));
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(text.as_str()).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(ChannelError::Disconnected(
                                "closed by server".to_string(),
                            ));
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable frame");
                return;
            }
        };

        if frame.message_type == "auth" {
            self.handle_auth(frame.message_body).await;
            return;
        }

        if self.inbound_tx.send(frame).await.is_err() {
            tracing::warn!("message dispatcher is gone; dropping frame");
        }
    }

    async fn handle_auth(&self, body: Value) {
        match body.as_str() {
            None => {
                // The server answers a failed handshake with `false`.
                tracing::warn!("authentication rejected by server");
                if let Err(e) = self
                    .store
                    .set_agent_error(AgentErrorKind::Authentication, "Not Authenticated")
                    .await
                {
                    tracing::warn!(error = %e, "failed to record auth status");
                }
            }
            Some(token) => {
                let claims = match decode_claims(token) {
                    Ok(claims) => claims,
                    Err(e) => {
                        tracing::warn!(error = %e, "token claims did not decode");
                        Claims::default()
                    }
                };
                if let Err(e) = self
                    .store
                    .set_agent_error(AgentErrorKind::Authentication, "Authenticated")
                    .await
                {
                    tracing::warn!(error = %e, "failed to record auth status");
                }
                let _ = self.auth_tx.send(AuthState {
                    token: Some(token.to_string()),
                    claims,
                });
            }
        }
    }
}
