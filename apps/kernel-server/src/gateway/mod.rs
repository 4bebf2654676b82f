// [[AXON]]/apps/kernel-server/src/gateway/mod.rs
// Purpose: Realtime WebSocket endpoint. Handshake, upgrade, drain control.
// Architecture: Gateway Layer
// Dependencies: axum, tokio

pub mod connection;
pub mod handlers;
pub mod registry;
pub mod sessions;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::auth::detect_mode;
use crate::kernel::Kernel;
use crate::protocol::{SUBPROTOCOL_BINARY, SUBPROTOCOL_JSON};

pub fn router(kernel: Arc<Kernel>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(kernel)
}

/// Handshake: authenticate from the upgrade headers, detect the client
/// mode, negotiate the wire subprotocol, then hand the socket to the
/// connection pumps. The session/connection caps are enforced at
/// registration so the refusal arrives as close code 4003.
async fn ws_handler(
    State(kernel): State<Arc<Kernel>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> Response {
    if kernel.is_draining() {
        return crate::error::KernelError::ShuttingDown.into_response();
    }
    let principal = match kernel.auth.authenticate_headers(&headers) {
        Ok(principal) => principal,
        Err(e) => return e.into_response(),
    };
    let mode = detect_mode(&headers);

    let max_message = kernel.cfg.gateway.max_message_size;
    let write_buffer = kernel.cfg.gateway.write_buffer_size;
    ws.protocols([SUBPROTOCOL_JSON, SUBPROTOCOL_BINARY])
        .max_message_size(max_message)
        .max_write_buffer_size(write_buffer.max(max_message))
        .on_upgrade(move |socket| connection::run_connection(kernel, socket, principal, mode))
}

/// Serve the gateway until the root shutdown token fires. New TCP accepts
/// stop once draining begins; live connections finish via their own pumps.
pub async fn serve(kernel: Arc<Kernel>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", kernel.cfg.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("gateway listening on ws://{}/ws", addr);

    let app = router(kernel.clone());
    let shutdown = kernel.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
