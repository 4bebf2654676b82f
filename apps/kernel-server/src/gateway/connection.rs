// [[AXON]]/apps/kernel-server/src/gateway/connection.rs
// Purpose: Per-connection reader/writer pumps, handshake state machine, backpressure.
// Architecture: Gateway Layer
// Dependencies: axum ws, tokio, futures

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::registry::HandlerCtx;
use super::sessions::{OutFrame, SessionEntry};
use crate::auth::Principal;
use crate::error::{close_code, rpc_code, KernelError};
use crate::events::DomainEvent;
use crate::kernel::Kernel;
use crate::models::{Agent, AgentStatus, Session, SessionMode};
use crate::protocol::{binary, methods, Frame, FrameKind, WireFormat};

/// Connection lifecycle: Connecting and Authenticating complete during the
/// HTTP upgrade; the socket starts here in Initializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Initializing,
    Ready,
    Draining,
}

pub async fn run_connection(
    kernel: Arc<Kernel>,
    socket: WebSocket,
    principal: Principal,
    mode: SessionMode,
) {
    let format = WireFormat::from_subprotocol(
        socket.protocol().and_then(|p| p.to_str().ok()),
    );
    let now = Utc::now();
    let session = Session {
        id: Uuid::new_v4(),
        agent_id: principal.agent_id.clone(),
        tenant_id: principal.tenant_id,
        mode,
        created_at: now,
        last_activity: now,
        ttl_secs: kernel.cfg.gateway.session_ttl_secs,
        refresh_token_hash: None,
        subscriptions: HashSet::new(),
    };
    let session_id = session.id;

    let (out_tx, out_rx) = mpsc::channel::<OutFrame>(kernel.cfg.gateway.send_queue_capacity);
    let cancel = kernel.shutdown.child_token();

    let (ws_sink, ws_stream) = socket.split();
    let mut writer = tokio::spawn(writer_pump(ws_sink, out_rx, format));

    // Registration enforces the global and per-tenant caps atomically.
    let entry = match kernel
        .sessions
        .try_register(session.clone(), out_tx.clone(), cancel.clone())
    {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!("connection refused for {}: {}", principal.agent_id, e);
            let _ = out_tx
                .send(OutFrame::Close {
                    code: close_code::TOO_MANY_CONNECTIONS,
                    reason: "too-many-connections".to_string(),
                })
                .await;
            let _ = writer.await;
            return;
        }
    };

    tracing::info!(
        "session {} opened: agent={} tenant={} mode={:?} wire={:?}",
        session_id,
        principal.agent_id,
        principal.tenant_id,
        mode,
        format
    );

    // First authenticated connection registers (or refreshes) the agent.
    register_agent(&kernel, &principal).await;
    if let Err(e) = kernel.repos.sessions.create(&session).await {
        tracing::debug!("session row persist failed: {}", e);
    }

    let event_pump = tokio::spawn(event_pump(
        kernel.clone(),
        entry.clone(),
        out_tx.clone(),
    ));

    // The reader pump runs in its own task so a panic is recovered here
    // instead of tearing down the process.
    let reader = tokio::spawn(reader_pump(
        kernel.clone(),
        ws_stream,
        entry.clone(),
        out_tx.clone(),
        principal.clone(),
        session_id,
    ));
    match reader.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            metrics::counter!("gateway_pump_panics_total", "pump" => "reader").increment(1);
            tracing::error!("reader pump for session {} panicked", session_id);
            let _ = out_tx
                .send(OutFrame::Close {
                    code: close_code::INTERNAL,
                    reason: "internal error".to_string(),
                })
                .await;
        }
        Err(_) => {}
    }

    // Teardown: cancel in-flight handlers, free table slots and limiter
    // buckets, drop the durable session row.
    event_pump.abort();
    kernel.sessions.remove(session_id);
    kernel
        .limits
        .forget_prefix(&format!("session:{}:", session_id));
    if let Err(e) = kernel.repos.sessions.delete(session_id).await {
        tracing::debug!("session row delete failed: {}", e);
    }
    // The writer ends once every sender is gone: ours, the table entry's,
    // and those held by handlers that are now cancelled.
    drop(entry);
    drop(out_tx);
    if let Err(e) = (&mut writer).await {
        if e.is_panic() {
            metrics::counter!("gateway_pump_panics_total", "pump" => "writer").increment(1);
        }
    }
    tracing::info!("session {} closed", session_id);
}

async fn register_agent(kernel: &Arc<Kernel>, principal: &Principal) {
    let now = Utc::now();
    let agent = Agent {
        id: principal.agent_id.clone(),
        tenant_id: principal.tenant_id,
        capabilities: HashSet::new(),
        status: AgentStatus::Active,
        active_tasks: 0,
        queued_tasks: 0,
        success_rate: 1.0,
        avg_completion_secs: 0.0,
        availability: 1.0,
        cost_rate: None,
        last_heartbeat: now,
        registered_at: now,
    };
    if let Err(e) = kernel.repos.agents.upsert(&agent).await {
        tracing::warn!("agent registration for {} failed: {}", principal.agent_id, e);
    }
    kernel.engine.invalidate_snapshot(principal.tenant_id);
}

async fn reader_pump(
    kernel: Arc<Kernel>,
    mut ws_stream: SplitStream<WebSocket>,
    entry: Arc<SessionEntry>,
    out_tx: mpsc::Sender<OutFrame>,
    principal: Principal,
    session_id: Uuid,
) {
    let mut state = ConnState::Initializing;
    let mut last_pong = Instant::now();
    let inflight = Arc::new(AtomicUsize::new(0));
    let mut ping_timer = tokio::time::interval(kernel.cfg.ping_interval());
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.reset(); // skip the immediate first tick

    loop {
        tokio::select! {
            _ = kernel.drain.cancelled(), if state != ConnState::Draining => {
                state = ConnState::Draining;
                let _ = out_tx
                    .send(OutFrame::Frame(Frame::notification(
                        methods::SHUTDOWN,
                        json!({"reason": "server shutting down"}),
                    )))
                    .await;
            }
            _ = entry.cancel.cancelled() => {
                // Final shutdown or forced revocation: close now.
                let _ = out_tx
                    .send(OutFrame::Close {
                        code: close_code::NORMAL,
                        reason: "shutdown".to_string(),
                    })
                    .await;
                break;
            }
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > kernel.cfg.pong_timeout() {
                    tracing::warn!("session {} pong timeout", session_id);
                    let _ = out_tx
                        .send(OutFrame::Close {
                            code: close_code::POLICY_VIOLATION,
                            reason: "pong timeout".to_string(),
                        })
                        .await;
                    break;
                }
                let _ = out_tx.send(OutFrame::Frame(Frame::ping())).await;
            }
            incoming = ws_stream.next() => {
                let Some(incoming) = incoming else { break };
                let message = match incoming {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!("session {} read error: {}", session_id, e);
                        break;
                    }
                };
                entry.touch();
                let frame = match message {
                    Message::Text(text) => match Frame::decode_json(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            let _ = out_tx
                                .send(OutFrame::Frame(Frame::error(
                                    None,
                                    rpc_code::INVALID_REQUEST,
                                    &format!("malformed frame: {}", e),
                                    None,
                                )))
                                .await;
                            continue;
                        }
                    },
                    Message::Binary(bytes) => match binary::decode_frame(&bytes) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!("session {} sent invalid binary frame: {}", session_id, e);
                            let _ = out_tx
                                .send(OutFrame::Close {
                                    code: close_code::INVALID_MESSAGE,
                                    reason: "invalid-message".to_string(),
                                })
                                .await;
                            break;
                        }
                    },
                    Message::Pong(_) => {
                        last_pong = Instant::now();
                        continue;
                    }
                    Message::Ping(_) => continue, // transport answers these
                    Message::Close(_) => break,
                };

                match frame.kind {
                    FrameKind::Ping => {
                        let _ = out_tx.send(OutFrame::Frame(Frame::pong())).await;
                    }
                    FrameKind::Pong => {
                        last_pong = Instant::now();
                    }
                    FrameKind::Notification => {
                        if frame.method.as_deref() == Some(methods::INITIALIZED) {
                            if state == ConnState::Initializing {
                                state = ConnState::Ready;
                                tracing::debug!("session {} ready", session_id);
                            }
                        }
                        // Other client notifications carry no obligations.
                    }
                    FrameKind::Request => {
                        let done = handle_request(
                            &kernel,
                            &entry,
                            &out_tx,
                            &principal,
                            session_id,
                            state,
                            &inflight,
                            frame,
                        )
                        .await;
                        if done {
                            break;
                        }
                    }
                    FrameKind::Response | FrameKind::Error => {
                        // The server does not issue requests to clients.
                        tracing::debug!("session {} sent unsolicited {:?}", session_id, frame.kind);
                    }
                }
            }
        }
    }
}

/// Returns true when the connection should close (client shutdown request).
#[allow(clippy::too_many_arguments)]
async fn handle_request(
    kernel: &Arc<Kernel>,
    _entry: &Arc<SessionEntry>,
    out_tx: &mpsc::Sender<OutFrame>,
    principal: &Principal,
    session_id: Uuid,
    state: ConnState,
    inflight: &Arc<AtomicUsize>,
    frame: Frame,
) -> bool {
    let id = frame.id.unwrap_or(0);
    let method = frame.method.clone().unwrap_or_default();
    let params = frame.params.unwrap_or(json!({}));

    // Draining connections complete in-flight responses but refuse new work.
    if state == ConnState::Draining {
        let _ = out_tx
            .send(OutFrame::Frame(Frame::error(
                Some(id),
                rpc_code::INVALID_REQUEST,
                "shutting-down",
                None,
            )))
            .await;
        return false;
    }

    let Some(spec) = kernel.registry.get(&method) else {
        let _ = out_tx
            .send(OutFrame::Frame(Frame::error(
                Some(id),
                rpc_code::METHOD_NOT_FOUND,
                &format!("method '{}' not found", method),
                None,
            )))
            .await;
        return false;
    };
    if spec.requires_ready && state != ConnState::Ready {
        let _ = out_tx
            .send(OutFrame::Frame(Frame::error(
                Some(id),
                rpc_code::INVALID_REQUEST,
                "session not initialized",
                None,
            )))
            .await;
        return false;
    }

    // Admission: per (session, method-class) bucket, then the tenant bucket.
    let class = methods::method_class(&method);
    let admitted = kernel
        .limits
        .check(&format!("session:{}:{}", session_id, class))
        .and_then(|_| kernel.limits.check(&format!("tenant:{}", principal.tenant_id)));
    if let Err(e) = admitted {
        let retry_after = e.retry_after().unwrap_or(1);
        crate::observability::record_request(&method, "rate-limited", std::time::Duration::ZERO);
        let _ = out_tx
            .send(OutFrame::Frame(Frame::error(
                Some(id),
                rpc_code::RATE_LIMITED,
                "rate limited",
                Some(json!({"retry_after": retry_after})),
            )))
            .await;
        return false;
    }

    // The client shutdown request is answered inline so the close frame
    // follows the response deterministically.
    if method == methods::SHUTDOWN {
        let ctx = HandlerCtx {
            kernel: kernel.clone(),
            session_id,
            principal: principal.clone(),
        };
        let result = kernel.registry.dispatch(&ctx, &method, params).await;
        let frame = match result {
            Ok(value) => Frame::response(id, value),
            Err(e) => Frame::error(Some(id), e.rpc_code(), &e.to_string(), None),
        };
        let _ = out_tx.send(OutFrame::Frame(frame)).await;
        let _ = out_tx
            .send(OutFrame::Close {
                code: close_code::NORMAL,
                reason: "client shutdown".to_string(),
            })
            .await;
        return true;
    }

    // Everything else runs on the shared pool; responses are matched by id.
    let ctx = HandlerCtx {
        kernel: kernel.clone(),
        session_id,
        principal: principal.clone(),
    };
    let out_tx = out_tx.clone();
    let cancel = _entry.cancel.clone();
    let inflight = inflight.clone();
    inflight.fetch_add(1, Ordering::AcqRel);
    tokio::spawn(async move {
        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(KernelError::ShuttingDown),
            result = ctx.kernel.registry.dispatch(&ctx, &method, params) => result,
        };
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        crate::observability::record_request(&method, status, started.elapsed());

        let response = match result {
            Ok(value) => Frame::response(id, value),
            Err(e) => {
                let data = e.retry_after().map(|s| json!({"retry_after": s}));
                tracing::warn!(
                    "method {} failed for session {}: kind={} {}",
                    method,
                    ctx.session_id,
                    e.kind(),
                    e
                );
                Frame::error(Some(id), e.rpc_code(), &e.to_string(), data)
            }
        };
        // Bounded send: a full queue blocks this handler, not the reader.
        let _ = out_tx.send(OutFrame::Frame(response)).await;
        inflight.fetch_sub(1, Ordering::AcqRel);
    });
    false
}

async fn writer_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutFrame>,
    format: WireFormat,
) {
    while let Some(out) = rx.recv().await {
        match out {
            OutFrame::Frame(frame) => {
                let message = match format {
                    WireFormat::Json => Message::Text(frame.encode_json()),
                    WireFormat::Binary => match binary::encode_frame(&frame) {
                        Ok(bytes) => Message::Binary(bytes),
                        Err(e) => {
                            tracing::error!("binary encode failed: {}; frame dropped to log", e);
                            continue;
                        }
                    },
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            OutFrame::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn event_pump(
    kernel: Arc<Kernel>,
    entry: Arc<SessionEntry>,
    out_tx: mpsc::Sender<OutFrame>,
) {
    let mut rx = kernel.events.subscribe();
    loop {
        let event: DomainEvent = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("session event pump lagged by {} events", missed);
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let tenant_match =
            event.tenant_id.is_none() || event.tenant_id == Some(entry.tenant_id());
        if !tenant_match || !entry.subscribed_to(event.topic.as_str()) {
            continue;
        }
        let frame = Frame::notification(
            methods::NOTIFY_EVENT,
            json!({
                "topic": event.topic,
                "kind": event.kind,
                "payload": event.payload,
                "timestamp": event.timestamp,
            }),
        );
        // Bounded send: a slow client backpressures its own event feed.
        if out_tx.send(OutFrame::Frame(frame)).await.is_err() {
            break;
        }
    }
}
