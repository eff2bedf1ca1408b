//! Health monitor
//!
//! Samples the connection fleet on a fixed interval, checks the metrics
//! against configured thresholds and keeps an alert ledger. Alerts stay
//! active until acknowledged and are pruned an hour after acknowledgment;
//! metric history is retained for an hour and feeds the trend estimate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::connection::SnapshotSource;
use crate::core::bus::{Bus, BusEvent};
use crate::core::config::HealthConfig;
use crate::core::constants::ALERT_GRACE_MS;
use crate::store::{ConnectionQuality, ConnectionStatus};

/// Samples considered by the trend estimate
const TREND_WINDOW: usize = 10;

/// Relative change bucketing the trend at +/-10%
const TREND_THRESHOLD: f64 = 0.10;

// =============================================================================
// Types
// =============================================================================

/// One fleet sample
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_connections: usize,
    /// Connections with quality EXCELLENT or GOOD
    pub healthy_connections: usize,
    pub average_latency: f64,
    /// Connections with reconnect attempts, over total
    pub reconnection_rate: f64,
    /// FAILED or SUSPENDED connections, over total
    pub error_rate: f64,
    /// Mean of memory pressure, connection saturation and reconnecting
    /// share, clamped to [0, 1]
    pub system_load: f64,
}

impl HealthMetrics {
    pub fn healthy_ratio(&self) -> f64 {
        if self.total_connections == 0 {
            1.0
        } else {
            self.healthy_connections as f64 / self.total_connections as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    HighLatency,
    HighErrorRate,
    LowConnectionQuality,
    SystemOverload,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighLatency => "HIGH_LATENCY",
            AlertType::HighErrorRate => "HIGH_ERROR_RATE",
            AlertType::LowConnectionQuality => "LOW_CONNECTION_QUALITY",
            AlertType::SystemOverload => "SYSTEM_OVERLOAD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "LOW",
            AlertSeverity::Medium => "MEDIUM",
            AlertSeverity::High => "HIGH",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub metrics: HealthMetrics,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthTrend {
    Improving,
    Stable,
    Degrading,
}

// =============================================================================
// Monitor
// =============================================================================

struct Inner {
    config: HealthConfig,
    source: Arc<dyn SnapshotSource>,
    bus: Bus,
    history: RwLock<VecDeque<HealthMetrics>>,
    alerts: RwLock<HashMap<String, Alert>>,
}

/// Periodic fleet health sampler
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(source: Arc<dyn SnapshotSource>, bus: Bus, config: HealthConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                bus,
                history: RwLock::new(VecDeque::new()),
                alerts: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Compute one sample from the current fleet snapshot
    pub fn sample(&self) -> HealthMetrics {
        let snapshot = self.inner.source.snapshot();
        let total = snapshot.len();

        let mut healthy = 0usize;
        let mut latency_sum = 0.0;
        let mut reconnecting = 0usize;
        let mut with_attempts = 0usize;
        let mut failed_or_suspended = 0usize;

        for conn in &snapshot {
            if matches!(
                conn.quality,
                ConnectionQuality::Excellent | ConnectionQuality::Good
            ) {
                healthy += 1;
            }
            latency_sum += conn.latency_ms;
            if conn.status == ConnectionStatus::Reconnecting {
                reconnecting += 1;
            }
            if conn.reconnect_attempts > 0 {
                with_attempts += 1;
            }
            if matches!(
                conn.status,
                ConnectionStatus::Failed | ConnectionStatus::Suspended
            ) {
                failed_or_suspended += 1;
            }
        }

        let ratio = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        let saturation = (total as f64 / 1_000.0).min(1.0);
        let system_load =
            ((memory_load() + saturation + ratio(reconnecting)) / 3.0).clamp(0.0, 1.0);

        HealthMetrics {
            timestamp: Utc::now(),
            total_connections: total,
            healthy_connections: healthy,
            average_latency: if total == 0 { 0.0 } else { latency_sum / total as f64 },
            reconnection_rate: ratio(with_attempts),
            error_rate: ratio(failed_or_suspended),
            system_load,
        }
    }

    /// Take one monitoring step; returns any newly raised alerts
    pub fn tick(&self) -> Vec<Alert> {
        let metrics = self.sample();

        {
            let mut history = self.inner.history.write();
            history.push_back(metrics.clone());
            let cutoff = Utc::now()
                - chrono::Duration::milliseconds(self.inner.config.history_retention_ms as i64);
            while history.front().is_some_and(|m| m.timestamp < cutoff) {
                history.pop_front();
            }
        }

        let breaches = self.evaluate(&metrics);
        let mut raised = Vec::new();
        {
            let mut alerts = self.inner.alerts.write();

            // Acknowledged alerts age out after the grace period
            let grace_cutoff = Utc::now() - chrono::Duration::milliseconds(ALERT_GRACE_MS as i64);
            alerts.retain(|_, alert| {
                !(alert.acknowledged
                    && alert.acknowledged_at.is_some_and(|at| at < grace_cutoff))
            });

            // Dedup against the alerts that existed before this tick, keyed
            // by (type, severity): one type can breach at two severities in
            // the same batch (SYSTEM_OVERLOAD via system load and via
            // reconnection rate), and an alert inserted moments ago must not
            // swallow its sibling
            let active: Vec<(AlertType, AlertSeverity)> = alerts
                .values()
                .filter(|a| !a.acknowledged)
                .map(|a| (a.alert_type, a.severity))
                .collect();

            for (alert_type, severity, message) in breaches {
                if active.contains(&(alert_type, severity)) {
                    continue;
                }
                let alert = Alert {
                    id: Uuid::new_v4().to_string(),
                    alert_type,
                    severity,
                    message,
                    metrics: metrics.clone(),
                    timestamp: Utc::now(),
                    acknowledged: false,
                    acknowledged_at: None,
                };
                alerts.insert(alert.id.clone(), alert.clone());
                raised.push(alert);
            }
        }

        for alert in &raised {
            tracing::warn!(
                alert_type = alert.alert_type.as_str(),
                severity = alert.severity.as_str(),
                message = %alert.message,
                "Health alert raised"
            );
            self.inner.bus.publish(BusEvent::HealthAlertRaised {
                alert_id: alert.id.clone(),
                alert_type: alert.alert_type.as_str().to_string(),
                severity: alert.severity.as_str().to_string(),
            });
        }
        raised
    }

    fn evaluate(&self, metrics: &HealthMetrics) -> Vec<(AlertType, AlertSeverity, String)> {
        let thresholds = &self.inner.config.thresholds;
        let mut breaches = Vec::new();

        if metrics.average_latency > thresholds.max_average_latency_ms {
            breaches.push((
                AlertType::HighLatency,
                AlertSeverity::High,
                format!(
                    "average latency {:.0}ms exceeds {:.0}ms",
                    metrics.average_latency, thresholds.max_average_latency_ms
                ),
            ));
        }
        if metrics.error_rate > thresholds.max_error_rate {
            breaches.push((
                AlertType::HighErrorRate,
                AlertSeverity::High,
                format!(
                    "error rate {:.2} exceeds {:.2}",
                    metrics.error_rate, thresholds.max_error_rate
                ),
            ));
        }
        if metrics.total_connections > 0 && metrics.healthy_ratio() < thresholds.min_healthy_ratio
        {
            breaches.push((
                AlertType::LowConnectionQuality,
                AlertSeverity::Medium,
                format!(
                    "healthy ratio {:.2} below {:.2}",
                    metrics.healthy_ratio(),
                    thresholds.min_healthy_ratio
                ),
            ));
        }
        if metrics.system_load > thresholds.max_system_load {
            breaches.push((
                AlertType::SystemOverload,
                AlertSeverity::Critical,
                format!(
                    "system load {:.2} exceeds {:.2}",
                    metrics.system_load, thresholds.max_system_load
                ),
            ));
        }
        if metrics.reconnection_rate > thresholds.max_reconnection_rate {
            breaches.push((
                AlertType::SystemOverload,
                AlertSeverity::High,
                format!(
                    "reconnection rate {:.2} exceeds {:.2}",
                    metrics.reconnection_rate, thresholds.max_reconnection_rate
                ),
            ));
        }
        breaches
    }

    /// Mark an alert acknowledged; returns whether it existed
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let mut alerts = self.inner.alerts.write();
        match alerts.get_mut(alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.alerts.read().values().cloned().collect()
    }

    pub fn history(&self) -> Vec<HealthMetrics> {
        self.inner.history.read().iter().cloned().collect()
    }

    /// Relative change of the healthy ratio between the first and second
    /// half of the most recent ten samples, bucketed at +/-10%
    pub fn trend(&self) -> HealthTrend {
        let history = self.inner.history.read();
        let recent: Vec<f64> = history
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .map(|m| m.healthy_ratio())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        if recent.len() < 2 {
            return HealthTrend::Stable;
        }

        let mid = recent.len() / 2;
        let first = recent[..mid].iter().sum::<f64>() / mid as f64;
        let second = recent[mid..].iter().sum::<f64>() / (recent.len() - mid) as f64;

        let change = if first.abs() < f64::EPSILON {
            if second > 0.0 { 1.0 } else { 0.0 }
        } else {
            (second - first) / first
        };

        if change > TREND_THRESHOLD {
            HealthTrend::Improving
        } else if change < -TREND_THRESHOLD {
            HealthTrend::Degrading
        } else {
            HealthTrend::Stable
        }
    }

    /// Spawn the periodic sampler
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        let interval = std::time::Duration::from_millis(monitor.inner.config.interval_ms);
        tokio::spawn(async move {
            tracing::debug!(interval_ms = interval.as_millis() as u64, "Health monitor started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                monitor.tick();
            }
            tracing::debug!("Health monitor stopped");
        })
    }
}

/// Resident-set share of total memory; zero where unsupported
#[cfg(target_os = "linux")]
fn memory_load() -> f64 {
    fn read() -> Option<f64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let total_kb: f64 = meminfo
            .lines()
            .find(|l| l.starts_with("MemTotal:"))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()?;
        Some((resident_pages * 4.0 / total_kb).clamp(0.0, 1.0))
    }
    read().unwrap_or(0.0)
}

#[cfg(not(target_os = "linux"))]
fn memory_load() -> f64 {
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::connection::ConnectionSnapshot;
    use parking_lot::Mutex;

    struct FakeSource {
        connections: Mutex<Vec<ConnectionSnapshot>>,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, connections: Vec<ConnectionSnapshot>) {
            *self.connections.lock() = connections;
        }
    }

    impl SnapshotSource for FakeSource {
        fn snapshot(&self) -> Vec<ConnectionSnapshot> {
            self.connections.lock().clone()
        }
    }

    fn conn(
        session_id: &str,
        status: ConnectionStatus,
        quality: ConnectionQuality,
        latency: f64,
        attempts: u32,
    ) -> ConnectionSnapshot {
        ConnectionSnapshot {
            session_id: session_id.to_string(),
            organization_id: "org-a".to_string(),
            status,
            quality,
            latency_ms: latency,
            jitter_ms: 0.0,
            reconnect_attempts: attempts,
        }
    }

    fn monitor(source: Arc<FakeSource>) -> HealthMonitor {
        HealthMonitor::new(source, Bus::new(), HealthConfig::default())
    }

    #[tokio::test]
    async fn test_all_critical_fleet_raises_latency_and_quality_alerts() {
        let source = FakeSource::new();
        source.set(
            (0..10)
                .map(|i| {
                    conn(
                        &format!("s{i}"),
                        ConnectionStatus::Connected,
                        ConnectionQuality::Critical,
                        1_500.0,
                        0,
                    )
                })
                .collect(),
        );
        let monitor = monitor(source);

        let raised = monitor.tick();
        let mut by_type: HashMap<AlertType, AlertSeverity> = raised
            .iter()
            .map(|a| (a.alert_type, a.severity))
            .collect();

        assert_eq!(
            by_type.remove(&AlertType::HighLatency),
            Some(AlertSeverity::High)
        );
        assert_eq!(
            by_type.remove(&AlertType::LowConnectionQuality),
            Some(AlertSeverity::Medium)
        );
        assert!(by_type.is_empty(), "unexpected extra alerts: {by_type:?}");
    }

    #[tokio::test]
    async fn test_healthy_fleet_raises_nothing() {
        let source = FakeSource::new();
        source.set(vec![
            conn("s1", ConnectionStatus::Connected, ConnectionQuality::Excellent, 20.0, 0),
            conn("s2", ConnectionStatus::Connected, ConnectionQuality::Good, 600.0, 0),
        ]);
        let monitor = monitor(source);
        assert!(monitor.tick().is_empty());
    }

    #[tokio::test]
    async fn test_error_rate_counts_failed_and_suspended() {
        let source = FakeSource::new();
        source.set(vec![
            conn("s1", ConnectionStatus::Failed, ConnectionQuality::Excellent, 0.0, 5),
            conn("s2", ConnectionStatus::Suspended, ConnectionQuality::Excellent, 0.0, 0),
            conn("s3", ConnectionStatus::Connected, ConnectionQuality::Excellent, 0.0, 0),
            conn("s4", ConnectionStatus::Connected, ConnectionQuality::Excellent, 0.0, 0),
        ]);
        let monitor = monitor(source);
        let metrics = monitor.sample();
        assert_eq!(metrics.error_rate, 0.5);
        assert_eq!(metrics.reconnection_rate, 0.25);
    }

    #[tokio::test]
    async fn test_simultaneous_overload_breaches_raise_both_alerts() {
        // System load and reconnection rate breach in the same tick; both
        // map to SYSTEM_OVERLOAD but at different severities, and neither
        // may mask the other
        let source = FakeSource::new();
        source.set(
            (0..10)
                .map(|i| {
                    conn(
                        &format!("s{i}"),
                        ConnectionStatus::Reconnecting,
                        ConnectionQuality::Excellent,
                        10.0,
                        1,
                    )
                })
                .collect(),
        );
        let config = HealthConfig {
            thresholds: crate::core::config::HealthThresholds {
                max_system_load: 0.3,
                ..Default::default()
            },
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(source, Bus::new(), config);

        let raised = monitor.tick();
        assert_eq!(raised.len(), 2, "unexpected alerts: {raised:?}");
        assert!(raised.iter().all(|a| a.alert_type == AlertType::SystemOverload));
        let severities: Vec<AlertSeverity> = raised.iter().map(|a| a.severity).collect();
        assert!(severities.contains(&AlertSeverity::Critical));
        assert!(severities.contains(&AlertSeverity::High));

        // Both stay deduplicated while unacknowledged
        assert!(monitor.tick().is_empty());

        // Acknowledging both clears the way for a fresh pair
        for alert in monitor.alerts() {
            assert!(monitor.acknowledge(&alert.id));
        }
        assert_eq!(monitor.tick().len(), 2);
    }

    #[tokio::test]
    async fn test_unacknowledged_alert_not_duplicated() {
        let source = FakeSource::new();
        source.set(vec![conn(
            "s1",
            ConnectionStatus::Connected,
            ConnectionQuality::Critical,
            2_000.0,
            0,
        )]);
        let monitor = monitor(source);

        let first = monitor.tick();
        assert!(!first.is_empty());
        let second = monitor.tick();
        assert!(second.is_empty());

        // Acknowledged alerts clear the way for a fresh one
        for alert in monitor.alerts() {
            assert!(monitor.acknowledge(&alert.id));
        }
        let third = monitor.tick();
        assert!(!third.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_alert() {
        let monitor = monitor(FakeSource::new());
        assert!(!monitor.acknowledge("nope"));
    }

    #[tokio::test]
    async fn test_trend_buckets() {
        let source = FakeSource::new();
        let monitor = monitor(Arc::clone(&source));

        // Degrading: healthy ratio falls from 1.0 to 0.0 over the window
        for healthy in [true, true, true, true, true, false, false, false, false, false] {
            source.set(vec![conn(
                "s1",
                ConnectionStatus::Connected,
                if healthy {
                    ConnectionQuality::Excellent
                } else {
                    ConnectionQuality::Critical
                },
                10.0,
                0,
            )]);
            monitor.tick();
        }
        assert_eq!(monitor.trend(), HealthTrend::Degrading);

        // Improving: five healthy samples behind the five degraded ones
        source.set(vec![conn(
            "s1",
            ConnectionStatus::Connected,
            ConnectionQuality::Excellent,
            10.0,
            0,
        )]);
        for _ in 0..5 {
            monitor.tick();
        }
        assert_eq!(monitor.trend(), HealthTrend::Improving);

        // Stable once the window is uniformly healthy
        for _ in 0..10 {
            monitor.tick();
        }
        assert_eq!(monitor.trend(), HealthTrend::Stable);
    }

    #[tokio::test]
    async fn test_empty_fleet_sample() {
        let monitor = monitor(FakeSource::new());
        let metrics = monitor.sample();
        assert_eq!(metrics.total_connections, 0);
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.average_latency, 0.0);
        assert_eq!(metrics.healthy_ratio(), 1.0);
    }
}
