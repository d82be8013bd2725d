// =============================================================================
// WebSocket endpoint — /ws/stock/prices
// =============================================================================
//
// On connect the client receives a `connected` message with its assigned
// id, then drives subscriptions via JSON messages (see `ws::handler`).
// Outbound traffic flows through the per-connection queue owned by the
// connection registry, so per-client ordering matches send order; the
// writer task drains that queue into the socket and a send failure tears
// the connection down.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::ws::handler::handle_message;
use crate::ws::messages::ConnectedMessage;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let client_id = format!("client_{}", &Uuid::new_v4().simple().to_string()[..8]);
    let (mut sink, mut stream) = socket.split();

    let mut outbound = state.hub.connections.register(&client_id);

    // Writer task: drain the registry queue into the socket. It ends when
    // the queue closes (disconnect/eviction) or a send fails.
    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!(client_id = %writer_id, error = %e, "websocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Greeting goes through the same queue to keep ordering uniform.
    state
        .hub
        .connections
        .send_json(&client_id, &ConnectedMessage::new(&client_id));
    info!(client_id, "websocket client connected");

    // Reader loop: handle inbound frames until the peer goes away.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some(response) = handle_message(&state.hub, &client_id, &text) {
                    state.hub.connections.send_json(&client_id, &response);
                }
            }
            Ok(Message::Ping(_)) => {
                // Axum answers protocol pings itself; track liveness.
                state.hub.connections.touch_ping(&client_id);
            }
            Ok(Message::Pong(_)) => {
                state.hub.connections.touch_ping(&client_id);
            }
            Ok(Message::Close(_)) => {
                info!(client_id, "websocket close frame received");
                break;
            }
            Ok(Message::Binary(_)) => {
                debug!(client_id, "binary frame ignored");
            }
            Err(e) => {
                warn!(client_id, error = %e, "websocket receive error");
                break;
            }
        }

        // The registry may have evicted this client (slow consumer or a
        // duplicate id); stop reading for it then.
        if !state.hub.connections.is_connected(&client_id) {
            debug!(client_id, "client no longer registered, ending reader");
            break;
        }
    }

    state.hub.disconnect(&client_id);
    writer.abort();
    info!(client_id, "websocket connection cleaned up");
}
