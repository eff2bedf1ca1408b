//! WebSocket gateway
//!
//! Accepts sockets on the configured path, performs the auth handshake,
//! registers the session with the connection manager, binds it to the
//! router's subscription table and demuxes inbound frames. Outbound
//! traffic flows through the session's bounded queue, drained by a
//! dedicated writer task; a write error leaves the session to the
//! heartbeat timeout path rather than tearing it down, so the client can
//! resume with its session id.

pub mod frames;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::audit::{AuditRecord, AuditSink};
use crate::auth::quota::QuotaTracker;
use crate::auth::{AuthError, Authenticator, Principal};
use crate::broker::Broker;
use crate::core::config::WsConfig;
use crate::core::constants::{HANDSHAKE_DEADLINE_SECS, PARSE_ERROR_THRESHOLD};
use crate::core::shutdown::ShutdownService;
use crate::queue::MessageQueue;
use crate::realtime::{
    ConnectionManager, EventRouter, HealthMonitor, PublishOptions, RealtimeError,
    connection::RegisterSession,
};
use crate::store::{ClientType, MetaService};
use frames::{FrameError, InboundFrame, OutboundFrame, close_code};
use session::FrameRateLimiter;

/// Writer-side control commands, multiplexed with routed events
enum WriterCommand {
    Frame(OutboundFrame),
    Close { code: u16, reason: String },
}

/// Everything a socket handler needs
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<WsConfig>,
    pub authenticator: Arc<dyn Authenticator>,
    pub manager: ConnectionManager,
    pub router: EventRouter,
    pub quota: Arc<QuotaTracker>,
    pub audit: Arc<dyn AuditSink>,
    pub broker: Broker,
    pub store: MetaService,
    pub health: HealthMonitor,
    pub queue: MessageQueue,
    pub shutdown: ShutdownService,
}

/// WebSocket gateway server
pub struct Gateway {
    state: GatewayState,
}

impl Gateway {
    pub fn new(state: GatewayState) -> Self {
        Self { state }
    }

    /// Build the axum router: the WS upgrade path plus liveness
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.state.config.path, get(ws_handler))
            .route("/healthz", get(healthz))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind and serve until shutdown
    pub async fn serve(&self, host: &str, port: u16) -> anyhow::Result<()> {
        let addr = format!("{host}:{port}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, path = %self.state.config.path, "Gateway listening");

        let shutdown = self.state.shutdown.wait();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    let max_payload = state.config.max_payload_length;
    ws.max_message_size(max_payload)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

async fn healthz(State(state): State<GatewayState>) -> Response {
    let broker_ok = state.broker.health_check().await.is_ok();
    let store_ok = state.store.health_check().await.is_ok();
    let stats = state.manager.stats();
    let queues = state.queue.stats().await.unwrap_or_default();

    let healthy = broker_ok && store_ok;
    let body = serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "broker": { "backend": state.broker.backend_name(), "ok": broker_ok },
        "store": { "backend": state.store.backend_name(), "ok": store_ok },
        "connections": {
            "total": stats.total,
            "averageLatency": stats.average_latency,
        },
        "queues": queues,
        "backpressureDrops": state.router.backpressure_drops(),
        "trend": state.health.trend(),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// =============================================================================
// Socket lifecycle
// =============================================================================

async fn handle_socket(state: GatewayState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    // Handshake: the first frame must authenticate within the deadline
    let handshake = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_DEADLINE_SECS),
        receiver.next(),
    )
    .await;

    let auth = match handshake {
        Ok(Some(Ok(Message::Text(text)))) => InboundFrame::parse(text.as_str()).ok(),
        _ => None,
    };
    let Some(InboundFrame::Auth {
        token,
        client_type,
        session_id: resume_id,
        metadata,
    }) = auth
    else {
        close_direct(&mut sender, close_code::UNAUTHORIZED, "auth frame required").await;
        return;
    };

    let principal = match state.authenticator.resolve(&token).await {
        Ok(principal) => principal,
        Err(e) => {
            tracing::debug!(error = %e, "Handshake rejected");
            close_direct(&mut sender, close_code::UNAUTHORIZED, "invalid credentials").await;
            return;
        }
    };

    if state.manager.stats().total >= state.config.max_connections {
        close_direct(&mut sender, close_code::TRY_AGAIN_LATER, "node at capacity").await;
        return;
    }

    // Resume only the caller's own session
    let resuming = resume_id.as_ref().is_some_and(|sid| {
        state
            .manager
            .get(sid)
            .is_some_and(|row| row.organization_id == principal.organization_id)
    });
    let session_id = if resuming {
        resume_id.unwrap_or_default()
    } else {
        Uuid::new_v4().to_string()
    };

    if !resuming
        && let Err(e) = state.quota.try_acquire_connection(&principal.organization_id)
    {
        state
            .audit
            .record(
                AuditRecord::new(
                    &principal.organization_id,
                    "connection.open",
                    &session_id,
                    "quota_exceeded",
                )
                .user(principal.user_id.clone()),
            )
            .await;
        tracing::debug!(error = %e, "Connection quota exceeded");
        close_direct(&mut sender, close_code::TENANT_SUSPENDED, "connection quota").await;
        return;
    }

    // Bind the outbound queue before registering so the reconnect seam
    // sees a live transport immediately
    let event_rx = state.router.register_session(
        &session_id,
        &principal.organization_id,
        principal.user_id.clone(),
    );

    let registration = state
        .manager
        .register(RegisterSession {
            session_id: session_id.clone(),
            organization_id: principal.organization_id.clone(),
            user_id: principal.user_id.clone(),
            client_type: client_type.unwrap_or(ClientType::ApiClient),
            metadata,
        })
        .await;
    if let Err(e) = registration {
        tracing::warn!(session_id = %session_id, error = %e, "Registration failed");
        state.router.drop_session(&session_id);
        if !resuming {
            state.quota.release_connection(&principal.organization_id);
        }
        close_direct(&mut sender, close_code::TRY_AGAIN_LATER, "registration failed").await;
        return;
    }

    // Single writer drains control frames and routed events
    let (control_tx, mut control_rx) = mpsc::channel::<WriterCommand>(64);
    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        let mut event_rx = event_rx;
        loop {
            tokio::select! {
                command = control_rx.recv() => match command {
                    Some(WriterCommand::Frame(frame)) => {
                        if sender
                            .send(Message::Text(frame.to_json().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(WriterCommand::Close { code, reason }) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        return;
                    }
                    None => break,
                },
                event = event_rx.recv() => match event {
                    Some(event) => {
                        if sender
                            .send(Message::Text(OutboundFrame::Event(event).to_json().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        // Write failure: let the heartbeat path drive the state machine
        tracing::debug!(session_id = %writer_session, "Writer stopped");
    });

    let graceful = read_loop(&state, &session_id, &principal, &control_tx, &mut receiver).await;

    if graceful {
        if let Err(e) = state.manager.remove(&session_id).await {
            tracing::debug!(session_id = %session_id, error = %e, "Remove after close failed");
        }
    }
    // Abrupt drops keep their state; the heartbeat monitor times the
    // session out and the reconnect schedule waits for the client

    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    tracing::debug!(session_id = %session_id, graceful, "Socket closed");
}

/// Returns true when the client closed cleanly
async fn read_loop(
    state: &GatewayState,
    session_id: &str,
    principal: &Principal,
    control_tx: &mpsc::Sender<WriterCommand>,
    receiver: &mut (impl futures::Stream<Item = Result<Message, axum::Error>> + Unpin),
) -> bool {
    let mut limiter = FrameRateLimiter::new(
        state.config.rate_limit.window_ms,
        state.config.rate_limit.max,
    );
    let mut parse_errors = 0u32;
    let mut shutdown_rx = state.shutdown.subscribe();
    let idle = Duration::from_secs(state.config.idle_timeout_secs);

    loop {
        let message = tokio::select! {
            _ = shutdown_rx.changed() => {
                send_close(control_tx, close_code::SERVER_SHUTDOWN, "server shutdown").await;
                return false;
            }
            message = tokio::time::timeout(idle, receiver.next()) => message,
        };

        let message = match message {
            Err(_) => {
                send_close(control_tx, close_code::NORMAL, "idle timeout").await;
                return false;
            }
            Ok(None) | Ok(Some(Err(_))) => return false,
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return true,
            Message::Binary(_) => {
                parse_errors += 1;
                if parse_errors > PARSE_ERROR_THRESHOLD {
                    send_close(control_tx, close_code::PARSE_LIMIT, "too many bad frames").await;
                    return false;
                }
                send_frame(control_tx, OutboundFrame::error("parse_error", "expected text")).await;
                continue;
            }
            // ping/pong handled by the protocol layer
            _ => continue,
        };

        if !limiter.allow() {
            state
                .audit
                .record(
                    AuditRecord::new(
                        &principal.organization_id,
                        "connection.rate_limit",
                        session_id,
                        "closed",
                    )
                    .user(principal.user_id.clone()),
                )
                .await;
            send_close(control_tx, close_code::RATE_LIMITED, "frame rate exceeded").await;
            return false;
        }

        let frame = match InboundFrame::parse(text.as_str()) {
            Ok(frame) => frame,
            Err(FrameError::UnknownType(t)) => {
                send_frame(
                    control_tx,
                    OutboundFrame::error("unknown_type", format!("unknown frame type '{t}'")),
                )
                .await;
                continue;
            }
            Err(FrameError::Malformed(reason)) => {
                parse_errors += 1;
                if parse_errors > PARSE_ERROR_THRESHOLD {
                    send_close(control_tx, close_code::PARSE_LIMIT, "too many bad frames").await;
                    return false;
                }
                send_frame(control_tx, OutboundFrame::error("parse_error", reason)).await;
                continue;
            }
        };

        match handle_frame(state, session_id, principal, frame).await {
            FrameOutcome::Reply(frame) => send_frame(control_tx, frame).await,
            FrameOutcome::Silent => {}
            FrameOutcome::Close { code, reason } => {
                send_close(control_tx, code, &reason).await;
                return false;
            }
        }
    }
}

enum FrameOutcome {
    Reply(OutboundFrame),
    Silent,
    Close { code: u16, reason: String },
}

async fn handle_frame(
    state: &GatewayState,
    session_id: &str,
    principal: &Principal,
    frame: InboundFrame,
) -> FrameOutcome {
    match frame {
        InboundFrame::Auth { .. } => {
            FrameOutcome::Reply(OutboundFrame::error("already_authenticated", "session is bound"))
        }

        InboundFrame::Subscribe {
            channel,
            filters,
            acknowledgment,
        } => match state
            .router
            .subscribe(principal, session_id, &channel, filters, acknowledgment)
            .await
        {
            Ok(_) => FrameOutcome::Reply(OutboundFrame::Subscribed { channel }),
            Err(e) => subscribe_failure(state, session_id, principal, &channel, e).await,
        },

        InboundFrame::Unsubscribe { channel } => {
            match state.router.unsubscribe(session_id, &channel) {
                Ok(()) => FrameOutcome::Reply(OutboundFrame::Unsubscribed { channel }),
                Err(RealtimeError::InvalidChannel(_)) => FrameOutcome::Reply(
                    OutboundFrame::error("invalid_channel", format!("invalid channel '{channel}'")),
                ),
                Err(_) => FrameOutcome::Silent,
            }
        }

        InboundFrame::Publish {
            channel,
            payload,
            event_type,
            priority,
            acknowledgment,
            metadata,
        } => {
            let event_type = InboundFrame::resolve_event_type(&event_type, &payload);
            let mut options = PublishOptions::event(event_type, payload)
                .priority(priority)
                .acknowledgment(acknowledgment);
            options.session_id = Some(session_id.to_string());
            if let Some(metadata) = metadata
                && let Some(correlation_id) = metadata.correlation_id
            {
                options.metadata = serde_json::json!({ "correlation_id": correlation_id });
            }

            match state.router.publish(principal, &channel, options).await {
                Ok(event) => FrameOutcome::Reply(OutboundFrame::Published { event_id: event.id }),
                Err(RealtimeError::Auth(AuthError::QuotaExceeded(reason))) => {
                    FrameOutcome::Reply(OutboundFrame::error("QUOTA_EXCEEDED", reason))
                }
                Err(RealtimeError::Auth(AuthError::Forbidden(reason))) => FrameOutcome::Close {
                    code: close_code::UNAUTHORIZED,
                    reason,
                },
                Err(RealtimeError::InvalidChannel(_)) => FrameOutcome::Reply(
                    OutboundFrame::error("invalid_channel", format!("invalid channel '{channel}'")),
                ),
                Err(e) => {
                    tracing::warn!(session_id, channel = %channel, error = %e, "Publish failed");
                    FrameOutcome::Reply(OutboundFrame::error("internal", "publish failed"))
                }
            }
        }

        InboundFrame::Heartbeat { metadata } | InboundFrame::Ping { metadata } => {
            let client_ts = metadata.and_then(|m| m.timestamp);
            match state.manager.update_heartbeat(session_id, client_ts).await {
                Ok(_) => FrameOutcome::Reply(OutboundFrame::Pong),
                Err(RealtimeError::SessionNotFound(_)) => FrameOutcome::Close {
                    code: close_code::NORMAL,
                    reason: "session expired".into(),
                },
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "Heartbeat failed");
                    FrameOutcome::Reply(OutboundFrame::Pong)
                }
            }
        }

        InboundFrame::Ack { event_id } => {
            state.router.acknowledge(session_id, &event_id);
            FrameOutcome::Silent
        }
    }
}

async fn subscribe_failure(
    state: &GatewayState,
    session_id: &str,
    principal: &Principal,
    channel: &str,
    error: RealtimeError,
) -> FrameOutcome {
    match error {
        RealtimeError::Auth(AuthError::Forbidden(reason)) => {
            state
                .audit
                .record(
                    AuditRecord::new(
                        &principal.organization_id,
                        "channel.subscribe",
                        channel,
                        "forbidden",
                    )
                    .user(principal.user_id.clone()),
                )
                .await;
            FrameOutcome::Close {
                code: close_code::UNAUTHORIZED,
                reason,
            }
        }
        RealtimeError::Auth(AuthError::QuotaExceeded(reason)) => {
            FrameOutcome::Reply(OutboundFrame::error("QUOTA_EXCEEDED", reason))
        }
        RealtimeError::InvalidChannel(_) => FrameOutcome::Reply(OutboundFrame::error(
            "invalid_channel",
            format!("invalid channel '{channel}'"),
        )),
        e => {
            tracing::warn!(session_id, channel, error = %e, "Subscribe failed");
            FrameOutcome::Reply(OutboundFrame::error("internal", "subscribe failed"))
        }
    }
}

async fn send_frame(control_tx: &mpsc::Sender<WriterCommand>, frame: OutboundFrame) {
    let _ = control_tx.send(WriterCommand::Frame(frame)).await;
}

async fn send_close(control_tx: &mpsc::Sender<WriterCommand>, code: u16, reason: &str) {
    let _ = control_tx
        .send(WriterCommand::Close {
            code,
            reason: reason.to_string(),
        })
        .await;
}

/// Close on a socket that has no writer task yet (handshake failures)
async fn close_direct(
    sender: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    code: u16,
    reason: &str,
) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}


impl std::fmt::Debug for FrameOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameOutcome::Reply(frame) => write!(f, "Reply({})", frame.to_json()),
            FrameOutcome::Silent => write!(f, "Silent"),
            FrameOutcome::Close { code, reason } => write!(f, "Close({code}, {reason})"),
        }
    }
}
