use super::AppState;
use crate::auth::OptionalAuth;
use crate::sync::{ClientConnection, Outgoing};
use agora_core::crdt::Role;
use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Share token (the session token travels as `token`, read by the auth
    /// extractor)
    pub share: Option<String>,
}

/// GET /docs/{doc}/sync - WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(doc): Path<String>,
    Query(query): Query<WsQuery>,
    OptionalAuth(auth): OptionalAuth,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = auth.map(|a| a.user.id);

    let (document, role) = match state.authorize(&doc, user_id.as_deref(), query.share.as_deref()) {
        Ok(granted) => granted,
        Err(e) => {
            warn!("WebSocket connection to {} rejected: {}", doc, e);
            return e.into_response();
        }
    };

    info!(
        "WebSocket upgrade: user={:?}, doc={}, role={}",
        user_id,
        document.id,
        role.as_str()
    );

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, document.id, role))
        .into_response()
}

/// Handle an established WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    user_id: Option<String>,
    doc_id: String,
    role: Role,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (room, broadcast_rx) = state.sync_state.join_room(&doc_id).await;
    let mut connection = ClientConnection::new(
        state.sync_state.next_connection_id(),
        user_id,
        role,
        room.clone(),
        broadcast_rx,
        state.ingest.clone(),
    );

    info!(
        "WebSocket connected: connection={}, doc={}, connections={}",
        connection.id,
        doc_id,
        room.connection_count()
    );

    run_session(&mut connection, &mut ws_tx, &mut ws_rx).await;

    info!(
        "WebSocket disconnected: connection={}, doc={}",
        connection.id, doc_id
    );

    // Dropping the connection releases its presence and unsubscribes
    drop(connection);
    state.sync_state.maybe_remove_room(&doc_id).await;
}

async fn run_session(
    connection: &mut ClientConnection,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
) {
    // Send stored state and current presence
    match connection.initial_sync() {
        Ok(frames) => {
            for frame in frames {
                if let Err(e) = ws_tx.send(Message::Binary(frame.into())).await {
                    error!("Failed to send initial state: {}", e);
                    return;
                }
            }
        }
        Err(e) => {
            error!("Failed to load {}: {}", connection.doc_id, e);
            return;
        }
    }

    loop {
        tokio::select! {
            // Handle incoming messages from client
            Some(msg) = ws_rx.next() => {
                match msg {
                    Ok(Message::Binary(data)) => {
                        for reply in connection.handle_message(&data) {
                            if let Err(e) = ws_tx.send(to_ws_message(reply)).await {
                                error!("Failed to send response: {}", e);
                                return;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client requested close");
                        return;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        return;
                    }
                    _ => {}
                }
            }

            // Handle frames from other connections
            Some(frame) = connection.recv_broadcast() => {
                if let Err(e) = ws_tx.send(Message::Binary(frame.into())).await {
                    error!("Failed to send broadcast: {}", e);
                    return;
                }
            }

            else => return,
        }
    }
}

fn to_ws_message(reply: Outgoing) -> Message {
    match reply {
        Outgoing::Binary(data) => Message::Binary(data.into()),
        Outgoing::Text(text) => Message::Text(text.into()),
    }
}
