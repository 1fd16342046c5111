pub mod config;
pub mod hub;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub use config::RelayConfig;
pub use hub::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/subnet/:name", get(subnet_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on `listener` until the server fails.
pub async fn serve(listener: tokio::net::TcpListener, state: RelayState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn health_check(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "subnets": state.subnet_count(),
        "members": state.member_count(),
    }))
}

async fn subnet_handler(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    let limit = state.config().max_message_bytes;
    ws.max_message_size(limit.saturating_mul(2))
        .on_upgrade(move |socket| handle_socket(socket, name, state))
}

async fn handle_socket(socket: WebSocket, subnet: String, state: RelayState) {
    let (member, mut outbound) = state.join(&subnet);
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let delivered = state.forward(&subnet, member, &text);
                debug!(subnet = %subnet, member, delivered, "frame relayed");
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => {
                    state.forward(&subnet, member, &text);
                }
                Err(_) => warn!(subnet = %subnet, member, "non-utf8 binary frame dropped"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(subnet = %subnet, member, error = %err, "socket error");
                break;
            }
        }
    }

    state.leave(&subnet, member);
    writer.abort();
}
