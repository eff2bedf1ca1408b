//! Internal lifecycle bus
//!
//! A single typed bus replaces ad-hoc string-named emitter events.
//! Components publish [`BusEvent`] envelopes; subscribers register at
//! startup and filter by [`BusTopic`]. Delivery is best-effort in-process
//! broadcast - durable cross-node fan-out goes through the broker's
//! `connection_events` topic instead.

use tokio::sync::broadcast;

use crate::store::types::{ConnectionQuality, ConnectionStatus};

/// Default bus channel capacity
const DEFAULT_BUS_CAPACITY: usize = 1_024;

/// Closed set of bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusTopic {
    ConnectionRegistered,
    ConnectionStatusChanged,
    QualityChanged,
    ReconnectionScheduled,
    ReconnectionFailed,
    ConnectionRemoved,
    HealthAlertRaised,
    BackpressureDrop,
}

/// Typed lifecycle envelope
#[derive(Debug, Clone)]
pub enum BusEvent {
    ConnectionRegistered {
        session_id: String,
        organization_id: String,
    },
    ConnectionStatusChanged {
        session_id: String,
        organization_id: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    QualityChanged {
        session_id: String,
        organization_id: String,
        from: ConnectionQuality,
        to: ConnectionQuality,
    },
    ReconnectionScheduled {
        session_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    ReconnectionFailed {
        session_id: String,
        attempts: u32,
    },
    ConnectionRemoved {
        session_id: String,
        organization_id: String,
    },
    HealthAlertRaised {
        alert_id: String,
        alert_type: String,
        severity: String,
    },
    BackpressureDrop {
        session_id: String,
        channel: String,
    },
}

impl BusEvent {
    pub fn topic(&self) -> BusTopic {
        match self {
            BusEvent::ConnectionRegistered { .. } => BusTopic::ConnectionRegistered,
            BusEvent::ConnectionStatusChanged { .. } => BusTopic::ConnectionStatusChanged,
            BusEvent::QualityChanged { .. } => BusTopic::QualityChanged,
            BusEvent::ReconnectionScheduled { .. } => BusTopic::ReconnectionScheduled,
            BusEvent::ReconnectionFailed { .. } => BusTopic::ReconnectionFailed,
            BusEvent::ConnectionRemoved { .. } => BusTopic::ConnectionRemoved,
            BusEvent::HealthAlertRaised { .. } => BusTopic::HealthAlertRaised,
            BusEvent::BackpressureDrop { .. } => BusTopic::BackpressureDrop,
        }
    }
}

/// In-process lifecycle bus
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody subscribes
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> BusSubscriber {
        BusSubscriber {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber handle; lagged gaps are skipped with a warning
pub struct BusSubscriber {
    rx: broadcast::Receiver<BusEvent>,
}

impl BusSubscriber {
    /// Receive the next event; returns None when the bus is gone
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
