use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::models::event::{Authenticated, ClientMessage, ErrorMessage, RealtimeEvent};
use crate::realtime::notifier::{Room, Subscription};
use crate::realtime::session::{
    Session, handle_client_message, register_connection, unregister_connection,
};
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let Some((session, subscription)) = authenticate(&state, &mut sender, &mut receiver).await
    else {
        let _ = sender.close().await;
        return;
    };
    let user_id = session.actor.user_id;

    let welcome = RealtimeEvent::Authenticated(Authenticated {
        user_id,
        role: session.actor.role,
    });
    if send_event(&mut sender, &welcome).await.is_err() {
        unregister_connection(&state, &session);
        return;
    }

    let mut events = ReceiverStream::new(subscription.receiver);
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let reply = match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => handle_client_message(&recv_state, &session, message),
                Err(err) => Some(RealtimeEvent::error(format!("malformed message: {err}"))),
            };

            if let Some(reply) = reply {
                recv_state.notifier.publish(&Room::User(user_id), reply);
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    unregister_connection(&state, &session);
}

type Sender = SplitSink<WebSocket, Message>;

/// Waits for the `authenticate` frame. Anything else first is refused with an
/// `authenticationError`.
async fn authenticate(
    state: &AppState,
    sender: &mut Sender,
    receiver: &mut SplitStream<WebSocket>,
) -> Option<(Session, Subscription)> {
    let text = loop {
        match receiver.next().await? {
            Ok(Message::Text(text)) => break text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    };

    let result = match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::Authenticate { user_id, role }) => {
            register_connection(state, user_id, role).map_err(|err| err.to_string())
        }
        Ok(_) => Err("first message must be authenticate".to_string()),
        Err(err) => Err(format!("malformed message: {err}")),
    };

    match result {
        Ok(registered) => Some(registered),
        Err(message) => {
            debug!(reason = %message, "websocket authentication refused");
            let refusal = RealtimeEvent::AuthenticationError(ErrorMessage { message });
            let _ = send_event(sender, &refusal).await;
            None
        }
    }
}

async fn send_event(sender: &mut Sender, event: &RealtimeEvent) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(err) => {
            warn!(event = event.name(), error = %err, "failed to serialize event for ws");
            return Ok(());
        }
    };

    sender.send(Message::Text(json.into())).await.inspect_err(|_| {
        info!(event = event.name(), "websocket send failed, client gone");
    })
}
