//! axum WebSocket transport.
//!
//! Every path upgrades. A request that is not a valid WebSocket upgrade gets
//! `400 Bad Request` with the rejection text and never reaches the manager.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};
use wsmux_core::ConnectionEvent;
use wsmux_core::event::CLOSE_NO_STATUS;

use super::{ConnectionSink, RawConnection};
use crate::connection::Message;
use crate::error::TransportError;
use crate::manager::{ConnectionManager, RejectReason};

#[derive(Clone)]
struct UpgradeState {
    manager: Arc<ConnectionManager>,
    max_message_size: usize,
}

/// Router that upgrades every request and hands the socket to `manager`.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(manager: Arc<ConnectionManager>, max_message_size: usize) -> Router {
    Router::new().fallback(upgrade).with_state(UpgradeState {
        manager,
        max_message_size,
    })
}

async fn upgrade(
    State(state): State<UpgradeState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let text = rejection.body_text();
            warn!(%remote, error = %text, "websocket upgrade failed");
            RejectReason::Handshake.record();
            return (StatusCode::BAD_REQUEST, text).into_response();
        }
    };

    ws.max_message_size(state.max_message_size)
        .on_failed_upgrade(move |error| warn!(%remote, %error, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let raw = into_raw(socket, Some(remote));
            if let Err(error) = state.manager.accept(raw).await {
                debug!(%remote, %error, "upgraded connection not tracked");
            }
        })
}

/// Split an upgraded socket into a [`RawConnection`].
pub fn into_raw(socket: WebSocket, remote_addr: Option<SocketAddr>) -> RawConnection {
    let (sink, stream) = socket.split();
    let events = stream
        .map(|frame| {
            frame
                .map(to_event)
                .map_err(|e| TransportError::Protocol(e.to_string()))
        })
        .boxed();
    RawConnection::new(remote_addr, events, Box::new(WsSink(sink)))
}

fn to_event(message: WsMessage) -> ConnectionEvent {
    match message {
        WsMessage::Text(text) => ConnectionEvent::Text(text.as_str().to_owned()),
        WsMessage::Binary(data) => ConnectionEvent::Binary(data),
        WsMessage::Ping(data) => ConnectionEvent::Ping(data),
        WsMessage::Pong(data) => ConnectionEvent::Pong(data),
        WsMessage::Close(Some(frame)) => ConnectionEvent::close(frame.code, frame.reason.as_str()),
        WsMessage::Close(None) => ConnectionEvent::close(CLOSE_NO_STATUS, ""),
    }
}

fn to_frame(message: Message) -> WsMessage {
    match message {
        Message::Text(text) => WsMessage::Text(text.into()),
        Message::Binary(data) => WsMessage::Binary(data),
        Message::Ping(data) => WsMessage::Ping(data),
        Message::Pong(data) => WsMessage::Pong(data),
    }
}

struct WsSink(SplitSink<WebSocket, WsMessage>);

#[async_trait]
impl ConnectionSink for WsSink {
    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.0
            .send(to_frame(message))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        self.0
            .send(WsMessage::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}
