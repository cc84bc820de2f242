//! `GET /ws` - real-time event subscriptions over WebSocket.
//!
//! The credential is checked before the upgrade, but the session is only
//! registered once the upgrade completes, so a rejected or abandoned
//! handshake never holds one. After `session.ready` the client sends
//! `subscribe`/`unsubscribe`/`ping` messages; the server writes event frames
//! from the session outbox and pings every 30 s. A missed pong closes the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Extension, Query,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;

use labflow_events::{
    ClientMessage, CloseReason, ConnectError, ControlFrame, OutboxItem, Session, SessionManager,
};

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::middleware::extract_bearer;

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    /// Browser clients cannot set headers on a WebSocket handshake.
    pub token: Option<String>,
}

pub async fn connect(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let credential = extract_bearer(&headers).or(query.token.as_deref());
    let identity = match services.sessions.authenticate(credential).await {
        Ok(identity) => identity,
        Err(e) => {
            let status = match e {
                ConnectError::Verify(labflow_auth::VerifyError::Unavailable(_)) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::UNAUTHORIZED,
            };
            return json_error(status, e.code(), e.to_string());
        }
    };

    let sessions = services.sessions.clone();
    ws.on_upgrade(move |socket| async move {
        let session = sessions.open(identity);
        let connection_id = session.connection_id();
        serve(socket, session, &sessions).await;
        sessions.close(connection_id);
    })
    .into_response()
}

type Sink = SplitSink<WebSocket, Message>;

async fn send_control(sink: &mut Sink, frame: &ControlFrame) -> bool {
    sink.send(Message::Text(frame.to_text())).await.is_ok()
}

async fn serve(socket: WebSocket, session: Arc<Session>, sessions: &SessionManager) {
    let connection_id = session.connection_id();
    let (mut sink, mut stream) = socket.split();

    if !send_control(&mut sink, &session.ready_frame()).await {
        return;
    }

    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            item = session.outbox().next() => match item {
                OutboxItem::Frame(frame) => {
                    if sink.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                OutboxItem::Resync { dropped } => {
                    if !send_control(&mut sink, &ControlFrame::Resync { dropped }).await {
                        break;
                    }
                }
                OutboxItem::Closed(reason) => {
                    if let CloseReason::Evicted(reason) = reason {
                        let _ = send_control(&mut sink, &ControlFrame::Evicted { reason }).await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_message(sessions, &session, &text);
                    if !send_control(&mut sink, &reply).await {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                Some(Ok(Message::Binary(_))) => {
                    let reply = ControlFrame::error("unsupported_message", "binary messages are not supported", None);
                    if !send_control(&mut sink, &reply).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "socket read failed");
                    break;
                }
            },
            _ = ping.tick() => {
                if awaiting_pong {
                    tracing::info!(connection_id = %connection_id, "pong missed, closing session");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn handle_client_message(sessions: &SessionManager, session: &Session, text: &str) -> ControlFrame {
    let connection_id = session.connection_id();
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Subscribe { scope }) => match sessions.subscribe(connection_id, scope.clone()) {
            Ok(()) => ControlFrame::Subscribed { scope },
            Err(e) => ControlFrame::error(e.code(), e.to_string(), Some(scope)),
        },
        Ok(ClientMessage::Unsubscribe { scope }) => match sessions.unsubscribe(connection_id, &scope) {
            Ok(_) => ControlFrame::Unsubscribed { scope },
            Err(e) => ControlFrame::error(e.code(), e.to_string(), Some(scope)),
        },
        Ok(ClientMessage::Ping) => ControlFrame::Pong,
        Err(e) => ControlFrame::error(e.code(), e.to_string(), None),
    }
}
