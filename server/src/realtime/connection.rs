//! Connection lifecycle manager
//!
//! Owns the session state machine:
//!
//! ```text
//! CONNECTED -> RECONNECTING -> { CONNECTED | FAILED }
//! ```
//!
//! plus SUSPENDED (admin/quota action) and terminal DISCONNECTED. Each
//! connected session gets an adaptive heartbeat monitor task; dropped
//! sessions get a reconnection timer driven by [`ReconnectPolicy`]. All
//! timer handles live in collections owned by this component and are
//! cancelled idempotently; they are never handed to collaborators.
//!
//! Heartbeats mutate only the in-memory row; the durable row is written on
//! every state transition and every K-th heartbeat to bound store IOPS.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::RealtimeError;
use super::reconnect::{ReconnectPolicy, SystemSnapshot};
use crate::broker::{Broker, CONNECTION_EVENTS_CHANNEL, events_topic};
use crate::core::bus::{Bus, BusEvent};
use crate::core::config::{HeartbeatConfig, RetryConfig};
use crate::core::constants::{
    CLEANUP_SWEEP_INTERVAL_SECS, HEARTBEAT_ADAPTIVE_DEADBAND_MS, HEARTBEAT_PERSIST_EVERY,
    SHUTDOWN_TIMEOUT_SECS,
};
use crate::store::{
    ClientType, ConnectionQuality, ConnectionRow, ConnectionStatus, MetaService,
    TenantContext,
};

/// Disconnected sessions older than this are swept away entirely
const STALE_CONNECTION_SECS: i64 = 3_600;

/// EMA smoothing factor for latency and jitter
const LATENCY_EMA_ALPHA: f64 = 0.1;

// =============================================================================
// Public types
// =============================================================================

/// Parameters for registering a new session
#[derive(Debug, Clone)]
pub struct RegisterSession {
    pub session_id: String,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub client_type: ClientType,
    pub metadata: serde_json::Value,
}

/// Outcome of a processed heartbeat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatResult {
    /// Raw latency of this heartbeat, clamped to >= 0
    pub latency_ms: f64,
    pub quality: ConnectionQuality,
}

/// Point-in-time view of one session, for health sampling
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub session_id: String,
    pub organization_id: String,
    pub status: ConnectionStatus,
    pub quality: ConnectionQuality,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub reconnect_attempts: u32,
}

/// Aggregate connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub total: usize,
    pub by_status: HashMap<ConnectionStatus, usize>,
    pub by_quality: HashMap<ConnectionQuality, usize>,
    pub average_latency: f64,
    pub total_reconnect_attempts: u64,
}

/// Source of connection snapshots (seam for the health monitor)
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Vec<ConnectionSnapshot>;
}

/// Re-attempts the transport handshake for a dropped session
///
/// The gateway's implementation reports success once the client has
/// re-attached a live socket for the session.
#[async_trait]
pub trait ReconnectTransport: Send + Sync {
    async fn attempt(&self, session_id: &str) -> Result<(), RealtimeError>;
}

// =============================================================================
// Internal state
// =============================================================================

struct Live {
    row: ConnectionRow,
    ema_latency: f64,
    ema_jitter: f64,
    heartbeat_count: u32,
    /// Hot-path clock for staleness checks (mockable under tokio test time)
    last_seen: Instant,
}

enum ScheduleAction {
    Fail {
        row: ConnectionRow,
        from: ConnectionStatus,
    },
    Arm {
        row: ConnectionRow,
        from: ConnectionStatus,
        attempt: u32,
        delay_ms: u64,
    },
}

struct Inner {
    heartbeat: HeartbeatConfig,
    policy: ReconnectPolicy,
    connections: DashMap<String, Live>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
    reconnects: Mutex<HashMap<String, JoinHandle<()>>>,
    stability: Mutex<HashMap<String, JoinHandle<()>>>,
    store: MetaService,
    bus: Bus,
    broker: Broker,
    transport: RwLock<Option<Arc<dyn ReconnectTransport>>>,
}

/// Session state machine owner
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

// =============================================================================
// Quality scoring
// =============================================================================

/// Missed-heartbeat rules first, then the raw latency of the sample
pub fn score_quality(missed_heartbeats: u32, latency_ms: f64) -> ConnectionQuality {
    if missed_heartbeats > 2 {
        ConnectionQuality::Critical
    } else if missed_heartbeats > 1 {
        ConnectionQuality::Poor
    } else if latency_ms > 1_000.0 {
        ConnectionQuality::Poor
    } else if latency_ms > 500.0 {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Excellent
    }
}

impl ConnectionManager {
    pub fn new(
        store: MetaService,
        broker: Broker,
        bus: Bus,
        heartbeat: HeartbeatConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                heartbeat,
                policy: ReconnectPolicy::new(retry),
                connections: DashMap::new(),
                monitors: Mutex::new(HashMap::new()),
                reconnects: Mutex::new(HashMap::new()),
                stability: Mutex::new(HashMap::new()),
                store,
                bus,
                broker,
                transport: RwLock::new(None),
            }),
        }
    }

    /// Install the transport used for reconnection attempts (gateway wiring)
    pub fn set_transport(&self, transport: Arc<dyn ReconnectTransport>) {
        *self.inner.transport.write() = Some(transport);
    }

    // =========================================================================
    // Registration and removal
    // =========================================================================

    /// Register a session, persist its row and start its monitors
    pub async fn register(&self, params: RegisterSession) -> Result<ConnectionRow, RealtimeError> {
        // A re-register for a known session is a transport re-attachment
        if self.inner.connections.contains_key(&params.session_id) {
            self.mark_reconnected(&params.session_id).await?;
            return self
                .get(&params.session_id)
                .ok_or_else(|| RealtimeError::SessionNotFound(params.session_id.clone()));
        }

        let now = Utc::now();
        let row = ConnectionRow {
            session_id: params.session_id.clone(),
            organization_id: params.organization_id.clone(),
            user_id: params.user_id,
            client_type: params.client_type,
            status: ConnectionStatus::Connected,
            connected_at: now,
            last_heartbeat: now,
            disconnected_at: None,
            reconnect_attempts: 0,
            max_reconnect_attempts: self.inner.policy.max_attempts(),
            next_reconnect_at: None,
            quality: ConnectionQuality::Excellent,
            latency_ms: 0.0,
            missed_heartbeats: 0,
            total_disconnections: 0,
            metadata: params.metadata,
        };

        self.inner.connections.insert(
            params.session_id.clone(),
            Live {
                row: row.clone(),
                ema_latency: 0.0,
                ema_jitter: 0.0,
                heartbeat_count: 0,
                last_seen: Instant::now(),
            },
        );

        self.persist(&row).await;
        self.inner.bus.publish(BusEvent::ConnectionRegistered {
            session_id: row.session_id.clone(),
            organization_id: row.organization_id.clone(),
        });
        self.publish_lifecycle(
            &row.organization_id,
            serde_json::json!({
                "type": "connection.registered",
                "sessionId": row.session_id,
                "organizationId": row.organization_id,
                "timestamp": now.to_rfc3339(),
            }),
        )
        .await;

        self.spawn_monitor(params.session_id);
        tracing::debug!(session_id = %row.session_id, organization_id = %row.organization_id, "Session registered");
        Ok(row)
    }

    /// Remove a session: cancel its timers, persist the terminal row
    pub async fn remove(&self, session_id: &str) -> Result<(), RealtimeError> {
        self.cancel_timers(session_id);

        let Some((_, mut live)) = self.inner.connections.remove(session_id) else {
            return Err(RealtimeError::SessionNotFound(session_id.to_string()));
        };
        let from = live.row.status;
        live.row.status = ConnectionStatus::Disconnected;
        live.row.disconnected_at = Some(Utc::now());

        self.persist(&live.row).await;
        if from != ConnectionStatus::Disconnected {
            self.emit_status_change(&live.row, from).await;
        }
        self.inner.bus.publish(BusEvent::ConnectionRemoved {
            session_id: session_id.to_string(),
            organization_id: live.row.organization_id.clone(),
        });
        tracing::debug!(session_id, "Session removed");
        Ok(())
    }

    /// Admin/quota transition to an arbitrary status
    pub async fn update_status(
        &self,
        session_id: &str,
        status: ConnectionStatus,
    ) -> Result<(), RealtimeError> {
        let (row, from) = {
            let mut live = self
                .inner
                .connections
                .get_mut(session_id)
                .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;
            let from = live.row.status;
            live.row.status = status;
            if status != ConnectionStatus::Connected {
                live.row.disconnected_at = Some(Utc::now());
            }
            (live.row.clone(), from)
        };

        if !matches!(status, ConnectionStatus::Connected) {
            self.cancel_timers(session_id);
        }
        self.persist(&row).await;
        if from != status {
            self.emit_status_change(&row, from).await;
        }
        Ok(())
    }

    // =========================================================================
    // Heartbeats
    // =========================================================================

    /// Record a heartbeat; returns the sample latency and the recomputed
    /// quality. `client_ts_ms` in the future clamps latency to zero.
    pub async fn update_heartbeat(
        &self,
        session_id: &str,
        client_ts_ms: Option<i64>,
    ) -> Result<HeartbeatResult, RealtimeError> {
        let (result, change, persist_row) = {
            let mut live = self
                .inner
                .connections
                .get_mut(session_id)
                .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;

            let now = Utc::now();
            let raw_latency = client_ts_ms
                .map(|ts| (now.timestamp_millis() - ts).max(0) as f64)
                .unwrap_or(0.0);

            if live.heartbeat_count == 0 {
                live.ema_latency = raw_latency;
            } else {
                live.ema_latency += LATENCY_EMA_ALPHA * (raw_latency - live.ema_latency);
                let deviation = (raw_latency - live.ema_latency).abs();
                live.ema_jitter += LATENCY_EMA_ALPHA * (deviation - live.ema_jitter);
            }

            live.row.last_heartbeat = now;
            live.last_seen = Instant::now();
            live.row.missed_heartbeats = 0;
            live.row.latency_ms = live.ema_latency;
            live.heartbeat_count = live.heartbeat_count.wrapping_add(1);

            let quality = score_quality(0, raw_latency);
            let change = (live.row.quality != quality).then_some((live.row.quality, quality));
            live.row.quality = quality;

            let persist_row =
                (live.heartbeat_count % HEARTBEAT_PERSIST_EVERY == 0).then(|| live.row.clone());

            (
                HeartbeatResult {
                    latency_ms: raw_latency,
                    quality,
                },
                change.map(|(from, to)| (live.row.organization_id.clone(), from, to)),
                persist_row,
            )
        };

        if let Some((organization_id, from, to)) = change {
            self.inner.bus.publish(BusEvent::QualityChanged {
                session_id: session_id.to_string(),
                organization_id,
                from,
                to,
            });
        }
        if let Some(row) = persist_row {
            self.persist(&row).await;
        }
        Ok(result)
    }

    fn spawn_monitor(&self, session_id: String) {
        let manager = self.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move { manager.monitor_loop(id).await });
        if let Some(previous) = self.inner.monitors.lock().insert(session_id, handle) {
            previous.abort();
        }
    }

    /// Adaptive heartbeat + quality monitor for one session
    async fn monitor_loop(self, session_id: String) {
        let base = self.inner.heartbeat.interval_ms;
        let max_missed = self.inner.heartbeat.max_missed;
        let mut applied = base;

        loop {
            tokio::time::sleep(Duration::from_millis(applied)).await;

            let (timed_out, change) = {
                let Some(mut live) = self.inner.connections.get_mut(&session_id) else {
                    return;
                };
                if live.row.status != ConnectionStatus::Connected {
                    return;
                }

                let elapsed_ms = live.last_seen.elapsed().as_millis() as u64;
                let mut change = None;
                if elapsed_ms > applied {
                    live.row.missed_heartbeats += 1;
                    let quality = score_quality(live.row.missed_heartbeats, live.ema_latency);
                    if live.row.quality != quality {
                        change = Some((live.row.organization_id.clone(), live.row.quality, quality));
                        live.row.quality = quality;
                    }
                }

                let timed_out = live.row.missed_heartbeats > max_missed
                    || elapsed_ms > max_missed as u64 * base;

                // Adaptive frequency, applied only beyond the deadband
                let desired = match live.row.quality {
                    ConnectionQuality::Critical => base / 2,
                    ConnectionQuality::Poor => base * 3 / 4,
                    ConnectionQuality::Excellent => base * 3 / 2,
                    ConnectionQuality::Good => base,
                };
                if desired.abs_diff(applied) > HEARTBEAT_ADAPTIVE_DEADBAND_MS {
                    applied = desired;
                }

                (timed_out, change)
            };

            if let Some((organization_id, from, to)) = change {
                self.inner.bus.publish(BusEvent::QualityChanged {
                    session_id: session_id.clone(),
                    organization_id,
                    from,
                    to,
                });
            }

            if timed_out {
                tracing::debug!(session_id = %session_id, "Heartbeat timeout");
                self.handle_heartbeat_timeout(&session_id).await;
                return;
            }
        }
    }

    async fn handle_heartbeat_timeout(&self, session_id: &str) {
        let row = {
            let Some(mut live) = self.inner.connections.get_mut(session_id) else {
                return;
            };
            if live.row.status != ConnectionStatus::Connected {
                return;
            }
            live.row.status = ConnectionStatus::Disconnected;
            live.row.disconnected_at = Some(Utc::now());
            live.row.total_disconnections += 1;
            live.row.clone()
        };

        self.inner.monitors.lock().remove(session_id);
        self.persist(&row).await;
        self.emit_status_change(&row, ConnectionStatus::Connected).await;

        if let Err(e) = self.schedule_reconnection(session_id).await {
            tracing::warn!(session_id, error = %e, "Failed to schedule reconnection");
        }
    }

    // =========================================================================
    // Reconnection
    // =========================================================================

    /// Arm the next reconnection attempt (or fail the session permanently)
    pub async fn schedule_reconnection(&self, session_id: &str) -> Result<(), RealtimeError> {
        // Snapshot before taking an entry guard: iterating the map while
        // holding a shard lock would self-deadlock
        let system = self.system_snapshot();

        let action = {
            let mut live = self
                .inner
                .connections
                .get_mut(session_id)
                .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;
            let from = live.row.status;

            // Only dropped sessions reconnect; a stale timer firing after a
            // successful re-attach must not disturb a healthy session
            if !matches!(
                from,
                ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting
            ) {
                return Ok(());
            }

            if live.row.reconnect_attempts >= live.row.max_reconnect_attempts {
                live.row.status = ConnectionStatus::Failed;
                live.row.next_reconnect_at = None;
                ScheduleAction::Fail {
                    row: live.row.clone(),
                    from,
                }
            } else {
                live.row.reconnect_attempts += 1;
                live.row.status = ConnectionStatus::Reconnecting;
                let attempt = live.row.reconnect_attempts;
                let delay_ms = self.inner.policy.delay(attempt, &system);
                live.row.next_reconnect_at =
                    Some(Utc::now() + chrono::Duration::milliseconds(delay_ms as i64));
                ScheduleAction::Arm {
                    row: live.row.clone(),
                    from,
                    attempt,
                    delay_ms,
                }
            }
        };

        match action {
            ScheduleAction::Fail { row, from } => {
                self.persist(&row).await;
                self.emit_status_change(&row, from).await;
                self.inner.bus.publish(BusEvent::ReconnectionFailed {
                    session_id: session_id.to_string(),
                    attempts: row.reconnect_attempts,
                });
                self.publish_lifecycle(
                    &row.organization_id,
                    serde_json::json!({
                        "type": "connection.reconnection.failed",
                        "sessionId": session_id,
                        "attempts": row.reconnect_attempts,
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
                .await;
                tracing::warn!(session_id, attempts = row.reconnect_attempts, "Reconnection failed permanently");
            }
            ScheduleAction::Arm {
                row,
                from,
                attempt,
                delay_ms,
            } => {
                self.persist(&row).await;
                if from != ConnectionStatus::Reconnecting {
                    self.emit_status_change(&row, from).await;
                }
                self.inner.bus.publish(BusEvent::ReconnectionScheduled {
                    session_id: session_id.to_string(),
                    attempt,
                    delay_ms,
                });
                tracing::debug!(session_id, attempt, delay_ms, "Reconnection scheduled");
                self.arm_reconnect_timer(session_id.to_string(), delay_ms);
            }
        }
        Ok(())
    }

    fn arm_reconnect_timer(&self, session_id: String, delay_ms: u64) {
        let manager = self.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            let transport = manager.inner.transport.read().clone();
            let attempted = match transport {
                Some(transport) => transport.attempt(&id).await,
                None => Err(RealtimeError::TransportUnavailable(id.clone())),
            };

            match attempted {
                Ok(()) => {
                    if let Err(e) = manager.mark_reconnected(&id).await {
                        tracing::warn!(session_id = %id, error = %e, "Reconnect success handling failed");
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %id, error = %e, "Reconnect attempt failed");
                    if let Err(e) = manager.schedule_reconnection(&id).await {
                        tracing::warn!(session_id = %id, error = %e, "Failed to reschedule reconnection");
                    }
                }
            }
        });
        if let Some(previous) = self.inner.reconnects.lock().insert(session_id, handle) {
            previous.abort();
        }
    }

    /// The session's transport is live again
    pub async fn mark_reconnected(&self, session_id: &str) -> Result<(), RealtimeError> {
        let (row, from) = {
            let mut live = self
                .inner
                .connections
                .get_mut(session_id)
                .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;
            let from = live.row.status;
            live.row.status = ConnectionStatus::Connected;
            live.row.missed_heartbeats = 0;
            live.row.next_reconnect_at = None;
            live.row.disconnected_at = None;
            live.row.last_heartbeat = Utc::now();
            live.last_seen = Instant::now();
            (live.row.clone(), from)
        };

        // Detach rather than abort: this path commonly runs inside the
        // reconnect timer task itself, and a task must not cancel itself
        // mid-transition. A detached timer that fires later is screened out
        // by the status guard in schedule_reconnection.
        drop(self.inner.reconnects.lock().remove(session_id));

        self.persist(&row).await;
        if from != ConnectionStatus::Connected {
            self.emit_status_change(&row, from).await;
        }

        // After a stable stretch the attempt counter starts over
        self.arm_stability_timer(session_id.to_string());
        self.spawn_monitor(session_id.to_string());
        tracing::debug!(session_id, "Session reconnected");
        Ok(())
    }

    fn arm_stability_timer(&self, session_id: String) {
        let manager = self.clone();
        let id = session_id.clone();
        let reset_after = self.inner.policy.reset_after_ms();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(reset_after)).await;
            let row = {
                let Some(mut live) = manager.inner.connections.get_mut(&id) else {
                    return;
                };
                if live.row.status != ConnectionStatus::Connected {
                    return;
                }
                live.row.reconnect_attempts = 0;
                live.row.clone()
            };
            manager.persist(&row).await;
            tracing::debug!(session_id = %id, "Reconnect attempts reset after stable period");
        });
        if let Some(previous) = self.inner.stability.lock().insert(session_id, handle) {
            previous.abort();
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, session_id: &str) -> Option<ConnectionRow> {
        self.inner
            .connections
            .get(session_id)
            .map(|live| live.row.clone())
    }

    pub fn connections_for_org(&self, organization_id: &str) -> Vec<ConnectionRow> {
        self.inner
            .connections
            .iter()
            .filter(|live| live.row.organization_id == organization_id)
            .map(|live| live.row.clone())
            .collect()
    }

    pub fn connections_for_user(&self, organization_id: &str, user_id: &str) -> Vec<ConnectionRow> {
        self.inner
            .connections
            .iter()
            .filter(|live| {
                live.row.organization_id == organization_id
                    && live.row.user_id.as_deref() == Some(user_id)
            })
            .map(|live| live.row.clone())
            .collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        let mut latency_sum = 0.0;
        for live in self.inner.connections.iter() {
            stats.total += 1;
            *stats.by_status.entry(live.row.status).or_insert(0) += 1;
            *stats.by_quality.entry(live.row.quality).or_insert(0) += 1;
            latency_sum += live.ema_latency;
            stats.total_reconnect_attempts += live.row.reconnect_attempts as u64;
        }
        if stats.total > 0 {
            stats.average_latency = latency_sum / stats.total as f64;
        }
        stats
    }

    fn system_snapshot(&self) -> SystemSnapshot {
        let mut total = 0usize;
        let mut weight_sum = 0.0;
        for live in self.inner.connections.iter() {
            total += 1;
            weight_sum += live.row.quality.weight();
        }
        SystemSnapshot {
            total_connections: total,
            average_quality_weight: if total > 0 {
                weight_sum / total as f64
            } else {
                1.0
            },
        }
    }

    // =========================================================================
    // Recovery, sweeping, shutdown
    // =========================================================================

    /// Load CONNECTED/RECONNECTING rows from the store into memory.
    /// Monitors restart only for CONNECTED rows; the physical socket is
    /// gone, so their first heartbeat timeout drives them to reconnection.
    pub async fn recover(&self) -> Result<usize, RealtimeError> {
        let rows = self
            .inner
            .store
            .list_connections_by_status(
                &TenantContext::system(),
                &[ConnectionStatus::Connected, ConnectionStatus::Reconnecting],
            )
            .await?;

        let count = rows.len();
        for row in rows {
            let session_id = row.session_id.clone();
            let status = row.status;
            self.inner.connections.insert(
                session_id.clone(),
                Live {
                    ema_latency: row.latency_ms,
                    ema_jitter: 0.0,
                    heartbeat_count: 0,
                    last_seen: Instant::now(),
                    row,
                },
            );
            if status == ConnectionStatus::Connected {
                self.spawn_monitor(session_id);
            }
        }
        if count > 0 {
            tracing::info!(count, "Recovered connections from store");
        }
        Ok(count)
    }

    /// Periodically drop sessions that stayed soft-closed past the
    /// staleness threshold
    pub fn start_cleanup_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(CLEANUP_SWEEP_INTERVAL_SECS);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                let threshold = Utc::now() - chrono::Duration::seconds(STALE_CONNECTION_SECS);
                let stale: Vec<(String, String)> = manager
                    .inner
                    .connections
                    .iter()
                    .filter(|live| {
                        matches!(
                            live.row.status,
                            ConnectionStatus::Disconnected | ConnectionStatus::Failed
                        ) && live.row.disconnected_at.is_some_and(|at| at < threshold)
                    })
                    .map(|live| {
                        (
                            live.row.session_id.clone(),
                            live.row.organization_id.clone(),
                        )
                    })
                    .collect();

                for (session_id, organization_id) in stale {
                    manager.cancel_timers(&session_id);
                    manager.inner.connections.remove(&session_id);
                    let ctx = TenantContext::tenant(&organization_id);
                    if let Err(e) = manager.inner.store.delete_connection(&ctx, &session_id).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Stale row delete failed");
                    }
                    manager.inner.bus.publish(BusEvent::ConnectionRemoved {
                        session_id,
                        organization_id,
                    });
                }
            }
        })
    }

    /// Cancel all timers and persist final states (bounded by the shutdown
    /// grace period)
    pub async fn shutdown(&self) {
        for map in [
            &self.inner.monitors,
            &self.inner.reconnects,
            &self.inner.stability,
        ] {
            for (_, handle) in map.lock().drain() {
                handle.abort();
            }
        }

        let rows: Vec<ConnectionRow> = self
            .inner
            .connections
            .iter()
            .map(|live| live.row.clone())
            .collect();
        let persist_all = async {
            for row in &rows {
                self.persist(row).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), persist_all)
            .await
            .is_err()
        {
            tracing::warn!("Timed out persisting connection rows during shutdown");
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn cancel_timers(&self, session_id: &str) {
        for map in [
            &self.inner.monitors,
            &self.inner.reconnects,
            &self.inner.stability,
        ] {
            if let Some(handle) = map.lock().remove(session_id) {
                handle.abort();
            }
        }
    }

    async fn persist(&self, row: &ConnectionRow) {
        let ctx = TenantContext::tenant(&row.organization_id);
        if let Err(e) = self.inner.store.upsert_connection(&ctx, row).await {
            tracing::warn!(session_id = %row.session_id, error = %e, "Connection row write failed");
        }
    }

    async fn emit_status_change(&self, row: &ConnectionRow, from: ConnectionStatus) {
        self.inner.bus.publish(BusEvent::ConnectionStatusChanged {
            session_id: row.session_id.clone(),
            organization_id: row.organization_id.clone(),
            from,
            to: row.status,
        });
        self.publish_lifecycle(
            &row.organization_id,
            serde_json::json!({
                "type": "connection.status_changed",
                "sessionId": row.session_id,
                "organizationId": row.organization_id,
                "from": from.as_str(),
                "to": row.status.as_str(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
    }

    async fn publish_lifecycle(&self, organization_id: &str, payload: serde_json::Value) {
        let topic = events_topic(organization_id, CONNECTION_EVENTS_CHANNEL);
        let bytes = payload.to_string().into_bytes();
        if let Err(e) = self.inner.broker.publish(&topic, &bytes).await {
            tracing::warn!(topic = %topic, error = %e, "Lifecycle publish failed");
        }
    }
}

impl SnapshotSource for ConnectionManager {
    fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .connections
            .iter()
            .map(|live| ConnectionSnapshot {
                session_id: live.row.session_id.clone(),
                organization_id: live.row.organization_id.clone(),
                status: live.row.status,
                quality: live.row.quality,
                latency_ms: live.ema_latency,
                jitter_ms: live.ema_jitter,
                reconnect_attempts: live.row.reconnect_attempts,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bus::BusTopic;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn heartbeat_config() -> HeartbeatConfig {
        HeartbeatConfig::default()
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    fn manager_with(retry: RetryConfig) -> (ConnectionManager, Bus) {
        let bus = Bus::new();
        let manager = ConnectionManager::new(
            MetaService::in_memory(),
            Broker::in_memory(),
            bus.clone(),
            heartbeat_config(),
            retry,
        );
        (manager, bus)
    }

    fn params(session_id: &str, org: &str) -> RegisterSession {
        RegisterSession {
            session_id: session_id.to_string(),
            organization_id: org.to_string(),
            user_id: Some("u1".to_string()),
            client_type: ClientType::WebApp,
            metadata: serde_json::json!({}),
        }
    }

    struct NeverTransport;

    #[async_trait]
    impl ReconnectTransport for NeverTransport {
        async fn attempt(&self, session_id: &str) -> Result<(), RealtimeError> {
            Err(RealtimeError::TransportUnavailable(session_id.to_string()))
        }
    }

    /// Succeeds from the Nth call on
    struct FlakyTransport {
        calls: AtomicU32,
        succeed_from: u32,
    }

    #[async_trait]
    impl ReconnectTransport for FlakyTransport {
        async fn attempt(&self, session_id: &str) -> Result<(), RealtimeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_from {
                Ok(())
            } else {
                Err(RealtimeError::TransportUnavailable(session_id.to_string()))
            }
        }
    }

    #[test]
    fn test_quality_scoring_rules() {
        assert_eq!(score_quality(3, 0.0), ConnectionQuality::Critical);
        assert_eq!(score_quality(2, 0.0), ConnectionQuality::Poor);
        assert_eq!(score_quality(0, 1_500.0), ConnectionQuality::Poor);
        assert_eq!(score_quality(0, 700.0), ConnectionQuality::Good);
        assert_eq!(score_quality(0, 100.0), ConnectionQuality::Excellent);
        assert_eq!(score_quality(1, 100.0), ConnectionQuality::Excellent);
    }

    #[tokio::test]
    async fn test_heartbeat_quality_transitions() {
        let (manager, _bus) = manager_with(retry_config());
        manager.register(params("s1", "org-a")).await.unwrap();

        let mut qualities = Vec::new();
        for latency in [50i64, 450, 700, 1_200] {
            let client_ts = Utc::now().timestamp_millis() - latency;
            let result = manager
                .update_heartbeat("s1", Some(client_ts))
                .await
                .unwrap();
            qualities.push(result.quality);
            // Heartbeat always zeroes the missed counter
            assert_eq!(manager.get("s1").unwrap().missed_heartbeats, 0);
        }

        assert_eq!(
            qualities,
            vec![
                ConnectionQuality::Excellent,
                ConnectionQuality::Excellent,
                ConnectionQuality::Good,
                ConnectionQuality::Poor,
            ]
        );
    }

    #[tokio::test]
    async fn test_future_client_ts_clamps_latency() {
        let (manager, _bus) = manager_with(retry_config());
        manager.register(params("s1", "org-a")).await.unwrap();

        let future_ts = Utc::now().timestamp_millis() + 60_000;
        let result = manager
            .update_heartbeat("s1", Some(future_ts))
            .await
            .unwrap();
        assert_eq!(result.latency_ms, 0.0);
        assert_eq!(result.quality, ConnectionQuality::Excellent);
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_session() {
        let (manager, _bus) = manager_with(retry_config());
        let err = manager.update_heartbeat("ghost", None).await.unwrap_err();
        assert!(matches!(err, RealtimeError::SessionNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_sequence_then_failed() {
        let (manager, bus) = manager_with(retry_config());
        manager.set_transport(Arc::new(NeverTransport));
        let mut events = bus.subscribe();

        manager.register(params("s1", "org-a")).await.unwrap();
        // Force the disconnect path directly
        manager.handle_heartbeat_timeout("s1").await;

        let mut delays = Vec::new();
        let mut failed = false;
        while !failed {
            let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
                .await
                .expect("bus should keep emitting")
                .expect("bus open");
            match event {
                BusEvent::ReconnectionScheduled { delay_ms, .. } => delays.push(delay_ms),
                BusEvent::ReconnectionFailed { attempts, .. } => {
                    assert_eq!(attempts, 5);
                    failed = true;
                }
                _ => {}
            }
        }

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(
            manager.get("s1").unwrap().status,
            ConnectionStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_restores_and_resets_attempts() {
        let (manager, bus) = manager_with(retry_config());
        manager.set_transport(Arc::new(FlakyTransport {
            calls: AtomicU32::new(0),
            succeed_from: 3,
        }));
        let mut events = bus.subscribe();

        manager.register(params("s1", "org-a")).await.unwrap();
        manager.handle_heartbeat_timeout("s1").await;

        // Wait for the transition back to CONNECTED
        loop {
            let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
                .await
                .expect("bus should keep emitting")
                .expect("bus open");
            if let BusEvent::ConnectionStatusChanged { to, .. } = event
                && to == ConnectionStatus::Connected
            {
                break;
            }
        }

        let row = manager.get("s1").unwrap();
        assert_eq!(row.status, ConnectionStatus::Connected);
        assert_eq!(row.reconnect_attempts, 3);
        assert!(row.next_reconnect_at.is_none());

        // Stay heartbeat-alive through the stability window; afterwards the
        // attempt counter is back to zero
        for _ in 0..35 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let _ = manager.update_heartbeat("s1", None).await;
        }
        assert_eq!(manager.get("s1").unwrap().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_remove_is_terminal_and_idempotent_timers() {
        let (manager, bus) = manager_with(retry_config());
        let mut events = bus.subscribe();
        manager.register(params("s1", "org-a")).await.unwrap();

        manager.remove("s1").await.unwrap();
        assert!(manager.get("s1").is_none());

        // Registered + removed events observed
        let mut saw_removed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            if event.topic() == BusTopic::ConnectionRemoved {
                saw_removed = true;
                break;
            }
        }
        assert!(saw_removed);

        let err = manager.remove("s1").await.unwrap_err();
        assert!(matches!(err, RealtimeError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let (manager, _bus) = manager_with(retry_config());
        manager.register(params("s1", "org-a")).await.unwrap();
        manager.register(params("s2", "org-a")).await.unwrap();
        manager.register(params("s3", "org-b")).await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status[&ConnectionStatus::Connected], 3);
        assert_eq!(stats.by_quality[&ConnectionQuality::Excellent], 3);

        assert_eq!(manager.connections_for_org("org-a").len(), 2);
        assert_eq!(manager.connections_for_user("org-a", "u1").len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_loads_live_rows_only() {
        let store = MetaService::in_memory();
        let ctx = TenantContext::tenant("org-a");
        let now = Utc::now();
        for (session_id, status) in [
            ("s1", ConnectionStatus::Connected),
            ("s2", ConnectionStatus::Reconnecting),
            ("s3", ConnectionStatus::Disconnected),
        ] {
            store
                .upsert_connection(
                    &ctx,
                    &ConnectionRow {
                        session_id: session_id.into(),
                        organization_id: "org-a".into(),
                        user_id: None,
                        client_type: ClientType::SdkWidget,
                        status,
                        connected_at: now,
                        last_heartbeat: now,
                        disconnected_at: None,
                        reconnect_attempts: 0,
                        max_reconnect_attempts: 5,
                        next_reconnect_at: None,
                        quality: ConnectionQuality::Good,
                        latency_ms: 42.0,
                        missed_heartbeats: 0,
                        total_disconnections: 0,
                        metadata: serde_json::json!({}),
                    },
                )
                .await
                .unwrap();
        }

        let manager = ConnectionManager::new(
            store,
            Broker::in_memory(),
            Bus::new(),
            heartbeat_config(),
            retry_config(),
        );
        let recovered = manager.recover().await.unwrap();
        assert_eq!(recovered, 2);
        assert!(manager.get("s1").is_some());
        assert!(manager.get("s2").is_some());
        assert!(manager.get("s3").is_none());
        assert_eq!(manager.get("s1").unwrap().latency_ms, 42.0);
    }

    #[tokio::test]
    async fn test_suspend_cancels_monitoring() {
        let (manager, _bus) = manager_with(retry_config());
        manager.register(params("s1", "org-a")).await.unwrap();
        manager
            .update_status("s1", ConnectionStatus::Suspended)
            .await
            .unwrap();
        let row = manager.get("s1").unwrap();
        assert_eq!(row.status, ConnectionStatus::Suspended);
        assert!(manager.inner.monitors.lock().is_empty());
    }
}
