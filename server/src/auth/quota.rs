//! Per-tenant quota tracking
//!
//! Live counters for connections and channels plus a fixed-window counter
//! for published events. Ceilings come from the tenant config; an
//! organization row may override them at registration time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use super::AuthError;
use crate::core::config::TenantLimits;

/// Window for the event-rate quota
const EVENT_WINDOW: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start_ms: u64,
    count: u64,
}

/// Tracks per-organization resource usage against configured ceilings
pub struct QuotaTracker {
    defaults: TenantLimits,
    enabled: bool,
    overrides: DashMap<String, TenantLimits>,
    connections: DashMap<String, u64>,
    channels: DashMap<String, u64>,
    events: DashMap<String, WindowCounter>,
}

impl QuotaTracker {
    pub fn new(defaults: TenantLimits, enabled: bool) -> Self {
        Self {
            defaults,
            enabled,
            overrides: DashMap::new(),
            connections: DashMap::new(),
            channels: DashMap::new(),
            events: DashMap::new(),
        }
    }

    /// Install organization-specific ceilings (from its durable row)
    pub fn set_limits(&self, organization_id: &str, limits: TenantLimits) {
        self.overrides.insert(organization_id.to_string(), limits);
    }

    fn limits(&self, organization_id: &str) -> TenantLimits {
        self.overrides
            .get(organization_id)
            .map(|l| l.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Reserve a connection slot
    pub fn try_acquire_connection(&self, organization_id: &str) -> Result<(), AuthError> {
        if !self.enabled {
            return Ok(());
        }
        let limit = self.limits(organization_id).max_connections;
        let mut entry = self
            .connections
            .entry(organization_id.to_string())
            .or_insert(0);
        if *entry >= limit {
            return Err(AuthError::QuotaExceeded(format!(
                "connection limit {limit} reached for organization {organization_id}"
            )));
        }
        *entry += 1;
        Ok(())
    }

    /// Release a connection slot; idempotent at zero
    pub fn release_connection(&self, organization_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(organization_id) {
            *entry = entry.saturating_sub(1);
        }
    }

    /// Reserve a channel slot (called when a channel is materialized)
    pub fn try_acquire_channel(&self, organization_id: &str) -> Result<(), AuthError> {
        if !self.enabled {
            return Ok(());
        }
        let limit = self.limits(organization_id).max_channels;
        let mut entry = self
            .channels
            .entry(organization_id.to_string())
            .or_insert(0);
        if *entry >= limit {
            return Err(AuthError::QuotaExceeded(format!(
                "channel limit {limit} reached for organization {organization_id}"
            )));
        }
        *entry += 1;
        Ok(())
    }

    /// Release a channel slot (called when a channel is retired)
    pub fn release_channel(&self, organization_id: &str) {
        if let Some(mut entry) = self.channels.get_mut(organization_id) {
            *entry = entry.saturating_sub(1);
        }
    }

    /// Count a published event against the fixed-window ceiling
    pub fn record_event(&self, organization_id: &str) -> Result<(), AuthError> {
        if !self.enabled {
            return Ok(());
        }
        let limit = self.limits(organization_id).max_events;
        let now = Self::now_ms();
        let window_ms = EVENT_WINDOW.as_millis() as u64;

        let mut entry = self
            .events
            .entry(organization_id.to_string())
            .or_insert(WindowCounter {
                window_start_ms: now,
                count: 0,
            });
        if now.saturating_sub(entry.window_start_ms) >= window_ms {
            entry.window_start_ms = now;
            entry.count = 0;
        }
        if entry.count >= limit {
            return Err(AuthError::QuotaExceeded(format!(
                "event limit {limit} reached for organization {organization_id}"
            )));
        }
        entry.count += 1;
        Ok(())
    }

    /// Current live connection count for an organization
    pub fn connection_count(&self, organization_id: &str) -> u64 {
        self.connections
            .get(organization_id)
            .map(|c| *c)
            .unwrap_or(0)
    }
}
