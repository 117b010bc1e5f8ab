use crate::error::GatewayError;
use crate::protocol::{ClientMessage, ServerEvent};
use crate::session::Outbox;
use crate::state::AppState;
use crate::stats::GatewayStats;
use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use types::ids::SessionId;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn rate_key(session: SessionId) -> String {
    format!("{}:messages", session)
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session = SessionId::new();
    let outbox = match state.gateway.connect(session).await {
        Ok(outbox) => outbox,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting client");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    let writer = {
        let outbox = Arc::clone(&outbox);
        async move {
            while let Some(payload) = outbox.next().await {
                if sink.send(Message::Text(Utf8Bytes::from(payload))).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        }
    };

    let reader = {
        let state = state.clone();
        let outbox = Arc::clone(&outbox);
        async move {
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) => {
                        if !handle_client_text(&state, session, &outbox, text.as_str()) {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    };

    // Either side ending ends the session: the client went away, or the
    // outbox was closed (lagging, or gateway shutdown).
    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    let _ = state.gateway.disconnect(session);
    state.rate_limiter.remove(&rate_key(session));
}

/// Handle one text frame from a client. Returns `false` when the session
/// should end.
pub fn handle_client_text(state: &AppState, session: SessionId, outbox: &Outbox, text: &str) -> bool {
    let stats = state.gateway.stats();
    let per_second = state.config.session.messages_per_second.max(1);

    if let Err(e) = state
        .rate_limiter
        .check_rate_limit(&rate_key(session), per_second, f64::from(per_second))
    {
        GatewayStats::incr(&stats.rate_limited);
        return reply(outbox, ServerEvent::error(e.to_string()));
    }

    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            GatewayStats::incr(&stats.protocol_errors);
            return reply(outbox, ServerEvent::error(e.to_string()));
        }
    };

    let forwarded = match message {
        ClientMessage::Ping => return reply(outbox, ServerEvent::Pong),
        ClientMessage::Subscribe(request) => request
            .key()
            .map(|key| state.gateway.subscribe(session, key)),
        ClientMessage::Unsubscribe(request) => request
            .key()
            .map(|key| state.gateway.unsubscribe(session, key)),
    };

    match forwarded {
        Ok(Ok(())) => true,
        Ok(Err(GatewayError::Stopped)) => false,
        Ok(Err(e)) => reply(outbox, ServerEvent::error(e.to_string())),
        Err(e) => {
            GatewayStats::incr(&stats.protocol_errors);
            reply(outbox, ServerEvent::error(e.to_string()))
        }
    }
}

fn reply(outbox: &Outbox, event: ServerEvent) -> bool {
    match event.encode() {
        Ok(payload) => outbox.push(payload).is_ok(),
        Err(_) => true,
    }
}
