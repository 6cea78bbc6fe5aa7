use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use signal_proto::{ChannelMessage, RELAY_IDENTITY};
use signal_relay::{ClientHandle, RelayHost};
use thiserror::Error;
use tokio::{net::TcpListener, signal, sync::mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;

pub struct AppState {
    host: Arc<RelayHost>,
    upstream: mpsc::UnboundedSender<ChannelMessage>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Must be called from within a tokio runtime; starts the relay pump.
    pub fn new(host: Arc<RelayHost>, metrics: Option<PrometheusHandle>) -> Arc<Self> {
        let upstream = host.init_channel();
        Arc::new(Self {
            host,
            upstream,
            metrics,
        })
    }

    pub fn host(&self) -> &RelayHost {
        &self.host
    }

    fn forward(&self, identity: &str, frame: &[u8]) {
        match decode_frame(identity, frame) {
            Ok(message) => {
                if self.upstream.send(message).is_err() {
                    warn!(target = "relay", identity, "relay pump stopped, frame dropped");
                }
            }
            Err(err) => {
                counter!("beach_relay_frames_rejected_total", 1, "reason" => err.metric_label());
                warn!(target = "relay", identity, error = %err, "dropping frame");
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("sender {claimed} does not match connection identity {identity}")]
    SenderMismatch { claimed: String, identity: String },
}

impl FrameError {
    fn metric_label(&self) -> &'static str {
        match self {
            FrameError::InvalidJson(_) => "invalid_json",
            FrameError::SenderMismatch { .. } => "sender_mismatch",
        }
    }
}

/// Parse one inbound frame. Envelopes may only speak for the socket they
/// arrived on.
pub fn decode_frame(identity: &str, frame: &[u8]) -> Result<ChannelMessage, FrameError> {
    let message: ChannelMessage = serde_json::from_slice(frame)?;
    if let ChannelMessage::Relay(envelope) = &message {
        if envelope.sender != identity {
            return Err(FrameError::SenderMismatch {
                claimed: envelope.sender.clone(),
                identity: identity.to_string(),
            });
        }
    }
    Ok(message)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/clients", get(clients_handler))
        .route("/clients/:identity/close", post(close_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/:identity", get(ws_handler))
        .with_state(state)
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(target = "relay", "beach-relay listening on {}", config.listen_addr);

    let host = Arc::new(RelayHost::new(config.relay));
    let state = AppState::new(Arc::clone(&host), metrics);
    serve(listener, state, shutdown_signal()).await?;

    host.dispose();
    info!(target = "relay", "shutdown complete");
    Ok(())
}

pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!(target = "relay", "shutdown signal received");
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "clients": state.host.registry().len() }))
}

async fn clients_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.host.registry().snapshot())
}

async fn close_handler(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> impl IntoResponse {
    let closed = state.host.close_client_connection(&identity);
    let status = if closed {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(json!({ "identity": identity, "closed": closed })))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if identity == RELAY_IDENTITY {
        warn!(target = "relay", "refusing connection claiming the relay identity");
        return StatusCode::BAD_REQUEST.into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state, identity))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, identity: String) {
    let connection_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut outbound) = ClientHandle::channel();
    let replaced = state.host.add_client(identity.clone(), handle.clone());
    counter!("beach_relay_connections_total", 1);
    gauge!("beach_relay_clients_active", state.host.registry().len() as f64);
    info!(
        target = "relay",
        identity = %identity,
        connection_id = %connection_id,
        replaced,
        "client connected"
    );

    let writer_identity = identity.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target = "relay", identity = %writer_identity, error = %err, "failed to encode envelope");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(target = "relay", identity = %writer_identity, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => state.forward(&identity, text.as_bytes()),
            Ok(Message::Binary(bytes)) => state.forward(&identity, &bytes),
            Ok(Message::Close(frame)) => {
                info!(
                    target = "relay",
                    identity = %identity,
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    target = "relay",
                    identity = %identity,
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        }
    }

    // A newer connection may have taken over the identity.
    state.host.registry().remove_handle(&identity, &handle);
    gauge!("beach_relay_clients_active", state.host.registry().len() as f64);
    writer.abort();
    info!(
        target = "relay",
        identity = %identity,
        connection_id = %connection_id,
        "client disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_proto::{MessageKind, Recipient, SignalingEnvelope};

    #[test_timeout::timeout]
    fn decode_frame_accepts_own_envelopes_and_logs() {
        let envelope = SignalingEnvelope::new("alice", Recipient::peer("bob"), MessageKind::End, None);
        let frame = serde_json::to_vec(&ChannelMessage::Relay(envelope.clone())).unwrap();
        assert_eq!(
            decode_frame("alice", &frame).unwrap(),
            ChannelMessage::Relay(envelope)
        );

        let log = serde_json::to_vec(&ChannelMessage::Log("hello".into())).unwrap();
        assert!(matches!(
            decode_frame("anyone", &log).unwrap(),
            ChannelMessage::Log(text) if text == "hello"
        ));
    }

    #[test_timeout::timeout]
    fn decode_frame_rejects_spoofed_sender() {
        let envelope = SignalingEnvelope::end("mallory", "bob");
        let frame = serde_json::to_vec(&ChannelMessage::Relay(envelope)).unwrap();
        let err = decode_frame("alice", &frame).unwrap_err();
        assert_eq!(err.metric_label(), "sender_mismatch");
    }

    #[test_timeout::timeout]
    fn decode_frame_rejects_garbage() {
        let err = decode_frame("alice", b"{not json").unwrap_err();
        assert_eq!(err.metric_label(), "invalid_json");
    }
}
