//! Event router and subscription manager
//!
//! Keeps both-direction subscription indices (`channel -> sessions` and
//! `session -> channels`) so fan-out and teardown are both O(1) lookups.
//! Published events are wrapped into queue messages; a queue worker calls
//! [`EventRouter::dispatch`], which enforces tenant isolation at dispatch
//! time so shared channels (like `system_events`) route correctly.
//!
//! Each registered session has a bounded outbound queue. When it fills,
//! fire-and-forget events are dropped for that session and counted;
//! acknowledgment events fail the dispatch instead and ride the queue's
//! retry path. Delivery per (channel, session) is FIFO; nothing is
//! promised across channels.
//!
//! Channels materialize lazily on first subscribe and are retired by a
//! sweep after staying subscriber-free for the configured TTL.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::RealtimeError;
use super::event::{ChannelType, Event};
use crate::auth::quota::QuotaTracker;
use crate::auth::rbac::PolicyEngine;
use crate::auth::{AuthError, Principal};
use crate::broker::{Broker, events_topic};
use crate::core::bus::{Bus, BusEvent};
use crate::core::config::ChannelConfig;
use crate::queue::{MessageHandler, MessageQueue, QueueError, QueueMessage};
use crate::store::{MetaService, TenantContext};

/// Queue message type carrying an event to dispatch
pub const DISPATCH_MESSAGE_TYPE: &str = "event.dispatch";

/// How often the channel sweep runs
const CHANNEL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Types
// =============================================================================

/// Channel identity: `(organization, name)`; global channels have no
/// organization component
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    organization_id: Option<String>,
    name: String,
}

impl ChannelKey {
    fn new(organization_id: &str, name: &str, channel_type: ChannelType) -> Self {
        Self {
            organization_id: (!channel_type.is_global()).then(|| organization_id.to_string()),
            name: name.to_string(),
        }
    }
}

/// A session's membership in a channel
#[derive(Debug, Clone)]
pub struct Subscription {
    pub session_id: String,
    pub channel: String,
    pub channel_type: ChannelType,
    pub filters: Option<serde_json::Value>,
    pub acknowledgment: bool,
    pub created_at: DateTime<Utc>,
}

/// Publish parameters beyond the channel name
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub acknowledgment: bool,
    pub session_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl PublishOptions {
    pub fn event(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            priority: 0,
            acknowledgment: false,
            session_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn acknowledgment(mut self, acknowledgment: bool) -> Self {
        self.acknowledgment = acknowledgment;
        self
    }
}

struct ChannelInfo {
    organization_id: Option<String>,
    empty_since: Option<Instant>,
}

struct SessionSink {
    organization_id: String,
    user_id: Option<String>,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    config: ChannelConfig,
    policy: Arc<dyn PolicyEngine>,
    quota: Arc<QuotaTracker>,
    queue: MessageQueue,
    store: MetaService,
    bus: Bus,
    broker: Broker,
    channels: DashMap<ChannelKey, ChannelInfo>,
    subscribers: DashMap<ChannelKey, HashSet<String>>,
    sessions: DashMap<String, HashMap<ChannelKey, Subscription>>,
    sinks: DashMap<String, SessionSink>,
    /// (event id -> sessions still owing an ack)
    pending_acks: DashMap<String, HashSet<String>>,
    drops: AtomicU64,
}

/// Channel registry and fan-out engine
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<Inner>,
}

impl EventRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChannelConfig,
        policy: Arc<dyn PolicyEngine>,
        quota: Arc<QuotaTracker>,
        queue: MessageQueue,
        store: MetaService,
        bus: Bus,
        broker: Broker,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                quota,
                queue,
                store,
                bus,
                broker,
                channels: DashMap::new(),
                subscribers: DashMap::new(),
                sessions: DashMap::new(),
                sinks: DashMap::new(),
                pending_acks: DashMap::new(),
                drops: AtomicU64::new(0),
            }),
        }
    }

    // =========================================================================
    // Session binding
    // =========================================================================

    /// Bind a session's outbound queue; the returned receiver is drained by
    /// the gateway's writer task
    pub fn register_session(
        &self,
        session_id: &str,
        organization_id: &str,
        user_id: Option<String>,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.inner.config.max_outbound);
        self.inner.sinks.insert(
            session_id.to_string(),
            SessionSink {
                organization_id: organization_id.to_string(),
                user_id,
                tx,
            },
        );
        self.inner
            .sessions
            .entry(session_id.to_string())
            .or_default();
        rx
    }

    /// Tear down everything a session owns; called when its connection is
    /// removed (never on a mere socket drop, which may reconnect)
    pub fn drop_session(&self, session_id: &str) {
        self.inner.sinks.remove(session_id);

        let Some((_, subscriptions)) = self.inner.sessions.remove(session_id) else {
            return;
        };
        for key in subscriptions.keys() {
            self.remove_subscriber(key, session_id);
        }

        self.inner.pending_acks.retain(|_, sessions| {
            sessions.remove(session_id);
            !sessions.is_empty()
        });
        tracing::debug!(session_id, count = subscriptions.len(), "Session subscriptions drained");
    }

    fn remove_subscriber(&self, key: &ChannelKey, session_id: &str) {
        let now_empty = match self.inner.subscribers.get_mut(key) {
            Some(mut set) => {
                set.remove(session_id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty
            && let Some(mut info) = self.inner.channels.get_mut(key)
        {
            info.empty_since = Some(Instant::now());
        }
    }

    // =========================================================================
    // Subscribe / unsubscribe
    // =========================================================================

    pub async fn subscribe(
        &self,
        principal: &Principal,
        session_id: &str,
        channel: &str,
        filters: Option<serde_json::Value>,
        acknowledgment: bool,
    ) -> Result<Subscription, RealtimeError> {
        let channel_type = ChannelType::classify(channel)
            .ok_or_else(|| RealtimeError::InvalidChannel(channel.to_string()))?;

        self.check_channel_access(principal, channel, channel_type)?;
        self.inner
            .policy
            .authorize(principal, "channel:read", channel)
            .await?;

        if !self.inner.sinks.contains_key(session_id) {
            return Err(RealtimeError::SessionNotFound(session_id.to_string()));
        }

        // Per-session subscription cap
        let current = self
            .inner
            .sessions
            .get(session_id)
            .map(|s| s.len())
            .unwrap_or(0);
        if current >= self.inner.config.max_subscriptions {
            return Err(AuthError::QuotaExceeded(format!(
                "subscription limit {} reached for session {session_id}",
                self.inner.config.max_subscriptions
            ))
            .into());
        }

        let key = ChannelKey::new(&principal.organization_id, channel, channel_type);

        // Lazily materialize the channel, charging the tenant's channel quota
        match self.inner.channels.entry(key.clone()) {
            dashmap::Entry::Occupied(mut entry) => {
                entry.get_mut().empty_since = None;
            }
            dashmap::Entry::Vacant(entry) => {
                if let Some(org) = &key.organization_id {
                    self.inner.quota.try_acquire_channel(org)?;
                }
                entry.insert(ChannelInfo {
                    organization_id: key.organization_id.clone(),
                    empty_since: None,
                });
            }
        }

        let subscription = Subscription {
            session_id: session_id.to_string(),
            channel: channel.to_string(),
            channel_type,
            filters,
            acknowledgment,
            created_at: Utc::now(),
        };

        self.inner
            .subscribers
            .entry(key.clone())
            .or_default()
            .insert(session_id.to_string());
        self.inner
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(key, subscription.clone());

        tracing::debug!(session_id, channel, "Subscribed");
        Ok(subscription)
    }

    pub fn unsubscribe(&self, session_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let organization_id = self
            .inner
            .sinks
            .get(session_id)
            .map(|sink| sink.organization_id.clone())
            .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;
        let channel_type = ChannelType::classify(channel)
            .ok_or_else(|| RealtimeError::InvalidChannel(channel.to_string()))?;
        let key = ChannelKey::new(&organization_id, channel, channel_type);

        let removed = self
            .inner
            .sessions
            .get_mut(session_id)
            .and_then(|mut subs| subs.remove(&key))
            .is_some();
        if removed {
            self.remove_subscriber(&key, session_id);
            tracing::debug!(session_id, channel, "Unsubscribed");
        }
        Ok(())
    }

    fn check_channel_access(
        &self,
        principal: &Principal,
        channel: &str,
        channel_type: ChannelType,
    ) -> Result<(), RealtimeError> {
        if channel_type == ChannelType::PrivateUser {
            let owner = channel.strip_prefix("user.").unwrap_or_default();
            let is_owner = principal.user_id.as_deref() == Some(owner);
            if !is_owner && !principal.has_permission("channel:admin") {
                return Err(AuthError::Forbidden(format!(
                    "private channel {channel} belongs to another user"
                ))
                .into());
            }
        }
        Ok(())
    }

    // =========================================================================
    // Publish / dispatch
    // =========================================================================

    /// Validate, persist and enqueue an event for dispatch
    pub async fn publish(
        &self,
        principal: &Principal,
        channel: &str,
        options: PublishOptions,
    ) -> Result<Event, RealtimeError> {
        let channel_type = ChannelType::classify(channel)
            .ok_or_else(|| RealtimeError::InvalidChannel(channel.to_string()))?;

        self.inner
            .policy
            .authorize(principal, "channel:write", channel)
            .await?;
        // Writes to the shared system channel are reserved for internal
        // services
        if channel_type == ChannelType::SystemEvents && !principal.has_permission("system:write") {
            return Err(AuthError::Forbidden(
                "system_events is writable by internal services only".into(),
            )
            .into());
        }

        self.inner.quota.record_event(&principal.organization_id)?;

        let mut event = Event::new(
            options.event_type,
            channel,
            options.payload,
            &principal.organization_id,
        );
        event.user_id = principal.user_id.clone();
        event.session_id = options.session_id;
        event.acknowledgment = options.acknowledgment;
        event.metadata = options.metadata;

        let ctx = TenantContext::tenant(&principal.organization_id);
        self.inner.store.insert_event(&ctx, &event.to_row()).await?;

        let message = QueueMessage::new(
            DISPATCH_MESSAGE_TYPE,
            serde_json::to_value(&event)
                .map_err(|e| RealtimeError::Queue(QueueError::Parse(e.to_string())))?,
        )
        .with_priority(options.priority)
        .with_tenant(&principal.organization_id);

        self.inner.queue.enqueue(message).await?;
        tracing::trace!(channel, event_id = %event.id, "Event enqueued");
        Ok(event)
    }

    /// Deliver an event to every matching local session
    ///
    /// Tenant isolation happens here: only sessions whose organization
    /// matches the event's receive it, whatever channel they sit on.
    pub async fn dispatch(&self, event: &Event) -> Result<(), RealtimeError> {
        let channel_type = ChannelType::classify(&event.channel)
            .ok_or_else(|| RealtimeError::InvalidChannel(event.channel.clone()))?;
        let key = ChannelKey::new(&event.organization_id, &event.channel, channel_type);

        // Peer nodes observe the fan-out topic
        let topic = events_topic(&event.organization_id, &event.channel);
        if let Ok(bytes) = serde_json::to_vec(event)
            && let Err(e) = self.inner.broker.publish(&topic, &bytes).await
        {
            tracing::warn!(topic = %topic, error = %e, "Fan-out publish failed");
        }

        let targets: Vec<String> = self
            .inner
            .subscribers
            .get(&key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        // Private channels deliver to their owner only
        let private_owner = (channel_type == ChannelType::PrivateUser)
            .then(|| event.channel.strip_prefix("user.").unwrap_or_default());

        for session_id in targets {
            let Some(sink) = self.inner.sinks.get(&session_id) else {
                continue;
            };
            if sink.organization_id != event.organization_id {
                continue;
            }
            if let Some(owner) = private_owner
                && sink.user_id.as_deref() != Some(owner)
            {
                continue;
            }

            let subscription = self
                .inner
                .sessions
                .get(&session_id)
                .and_then(|subs| subs.get(&key).cloned());
            let Some(subscription) = subscription else {
                continue;
            };
            if !filters_match(subscription.filters.as_ref(), event) {
                continue;
            }

            let ack_required = event.acknowledgment || subscription.acknowledgment;
            match sink.tx.try_send(event.clone()) {
                Ok(()) => {
                    if ack_required {
                        self.inner
                            .pending_acks
                            .entry(event.id.clone())
                            .or_default()
                            .insert(session_id.clone());
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if ack_required {
                        // Let the queue redeliver the whole event
                        return Err(RealtimeError::Backpressure {
                            session_id,
                            channel: event.channel.clone(),
                        });
                    }
                    self.inner.drops.fetch_add(1, Ordering::Relaxed);
                    self.inner.bus.publish(BusEvent::BackpressureDrop {
                        session_id: session_id.clone(),
                        channel: event.channel.clone(),
                    });
                    tracing::debug!(session_id = %session_id, channel = %event.channel, "Backpressure drop");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Writer is gone; the session is either reconnecting or
                    // being removed, so just skip it this round
                    tracing::trace!(session_id = %session_id, "Outbound sink closed");
                }
            }
        }
        Ok(())
    }

    /// Clear a session's pending ack for an event; returns whether one existed
    pub fn acknowledge(&self, session_id: &str, event_id: &str) -> bool {
        let Some(mut pending) = self.inner.pending_acks.get_mut(event_id) else {
            return false;
        };
        let existed = pending.remove(session_id);
        let empty = pending.is_empty();
        drop(pending);
        if empty {
            self.inner.pending_acks.remove(event_id);
        }
        existed
    }

    /// Handler wiring this router into the queue's worker pool
    pub fn dispatch_handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(DispatchHandler {
            router: self.clone(),
        })
    }

    // =========================================================================
    // Maintenance and metrics
    // =========================================================================

    /// Retire channels that stayed subscriber-free past the TTL
    pub fn start_channel_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let ttl = Duration::from_millis(router.inner.config.default_ttl_ms);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(CHANNEL_SWEEP_INTERVAL) => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                let expired: Vec<(ChannelKey, Option<String>)> = router
                    .inner
                    .channels
                    .iter()
                    .filter(|entry| {
                        entry.empty_since.is_some_and(|since| since.elapsed() >= ttl)
                    })
                    .map(|entry| (entry.key().clone(), entry.organization_id.clone()))
                    .collect();

                for (key, organization_id) in expired {
                    router.inner.channels.remove(&key);
                    router.inner.subscribers.remove(&key);
                    if let Some(org) = organization_id {
                        router.inner.quota.release_channel(&org);
                    }
                    tracing::debug!(channel = %key.name, "Channel retired");
                }
            }
        })
    }

    /// Events dropped to backpressure since startup
    pub fn backpressure_drops(&self) -> u64 {
        self.inner.drops.load(Ordering::Relaxed)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn subscriptions_for(&self, session_id: &str) -> Vec<Subscription> {
        self.inner
            .sessions
            .get(session_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.inner.pending_acks.len()
    }

    /// Session ids a sink is registered for (used by the reconnect seam)
    pub fn has_sink(&self, session_id: &str) -> bool {
        self.inner.sinks.contains_key(session_id)
    }

    /// Whether a session has a registered sink whose writer still drains
    /// it; a dropped socket leaves the sink closed until the client
    /// re-attaches
    pub fn has_live_sink(&self, session_id: &str) -> bool {
        self.inner
            .sinks
            .get(session_id)
            .map(|sink| !sink.tx.is_closed())
            .unwrap_or(false)
    }
}

/// Optional per-subscription filter: a `type` key restricts delivery to
/// events of that type
fn filters_match(filters: Option<&serde_json::Value>, event: &Event) -> bool {
    match filters.and_then(|f| f.get("type")).and_then(|t| t.as_str()) {
        Some(wanted) => wanted == event.event_type,
        None => true,
    }
}

struct DispatchHandler {
    router: EventRouter,
}

#[async_trait]
impl MessageHandler for DispatchHandler {
    async fn handle(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let event: Event = serde_json::from_value(message.payload.clone())
            .map_err(|e| QueueError::Parse(e.to_string()))?;
        self.router
            .dispatch(&event)
            .await
            .map_err(|e| QueueError::handler(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::rbac::AllowAllPolicyEngine;
    use crate::core::config::{QueueSettings, TenantLimits};
    use crate::queue::QueueName;

    fn principal(org: &str, user: &str) -> Principal {
        Principal {
            organization_id: org.to_string(),
            user_id: Some(user.to_string()),
            roles: vec![],
            permissions: vec!["*:*".into()],
        }
    }

    fn router_with(config: ChannelConfig) -> EventRouter {
        let broker = Broker::in_memory();
        EventRouter::new(
            config,
            Arc::new(AllowAllPolicyEngine),
            Arc::new(QuotaTracker::new(TenantLimits::default(), true)),
            MessageQueue::new(broker.clone(), QueueSettings::default()),
            MetaService::in_memory(),
            Bus::new(),
            broker,
        )
    }

    fn test_router() -> EventRouter {
        router_with(ChannelConfig::default())
    }

    async fn subscribe(
        router: &EventRouter,
        principal: &Principal,
        session: &str,
        channel: &str,
    ) -> mpsc::Receiver<Event> {
        let rx = router.register_session(
            session,
            &principal.organization_id,
            principal.user_id.clone(),
        );
        router
            .subscribe(principal, session, channel, None, false)
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_basic_fanout_respects_tenancy() {
        let router = test_router();
        let org_a_u1 = principal("org-a", "u1");
        let org_a_u2 = principal("org-a", "u2");
        let org_b_v1 = principal("org-b", "v1");

        let mut rx1 = subscribe(&router, &org_a_u1, "s1", "agent_events").await;
        let mut rx2 = subscribe(&router, &org_a_u2, "s2", "agent_events").await;
        let mut rx3 = subscribe(&router, &org_b_v1, "s3", "agent_events").await;

        let event = Event::new(
            "agent_started",
            "agent_events",
            serde_json::json!({"agent": "a1"}),
            "org-a",
        );
        router.dispatch(&event).await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let received = rx.try_recv().unwrap();
            assert_eq!(received.organization_id, "org-a");
            assert_eq!(received.event_type, "agent_started");
        }
        // Same channel name, different tenant: nothing arrives
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_restores_indices() {
        let router = test_router();
        let user = principal("org-a", "u1");
        let _rx = router.register_session("s1", "org-a", Some("u1".into()));

        router
            .subscribe(&user, "s1", "agent_events", None, false)
            .await
            .unwrap();
        assert_eq!(router.subscriptions_for("s1").len(), 1);

        router.unsubscribe("s1", "agent_events").unwrap();
        assert!(router.subscriptions_for("s1").is_empty());

        // No deliveries after unsubscribe
        let event = Event::new("x", "agent_events", serde_json::json!({}), "org-a");
        router.dispatch(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_delivery_without_subscription() {
        let router = test_router();
        let user = principal("org-a", "u1");
        let mut rx = subscribe(&router, &user, "s1", "agent_events").await;

        // Event on a different channel the session never subscribed to
        let event = Event::new("x", "tool_events", serde_json::json!({}), "org-a");
        router.dispatch(&event).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscription_cap_boundary() {
        let router = router_with(ChannelConfig {
            max_subscriptions: 2,
            ..ChannelConfig::default()
        });
        let user = principal("org-a", "u1");
        let _rx = router.register_session("s1", "org-a", Some("u1".into()));

        router
            .subscribe(&user, "s1", "agent_events", None, false)
            .await
            .unwrap();
        router
            .subscribe(&user, "s1", "tool_events", None, false)
            .await
            .unwrap();

        let err = router
            .subscribe(&user, "s1", "workflow_events", None, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RealtimeError::Auth(AuthError::QuotaExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_private_channel_ownership() {
        let router = test_router();
        let u1 = Principal {
            permissions: vec!["channel:read".into(), "channel:write".into()],
            ..principal("org-a", "u1")
        };
        let _rx = router.register_session("s1", "org-a", Some("u1".into()));

        router
            .subscribe(&u1, "s1", "user.u1", None, false)
            .await
            .unwrap();
        let err = router
            .subscribe(&u1, "s1", "user.u2", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Auth(AuthError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let router = test_router();
        let user = principal("org-a", "u1");
        let _rx = router.register_session("s1", "org-a", Some("u1".into()));

        let err = router
            .subscribe(&user, "s1", "no_such_channel", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidChannel(_)));
    }

    #[tokio::test]
    async fn test_system_events_write_restricted() {
        let router = test_router();
        let regular = Principal {
            permissions: vec!["channel:read".into(), "channel:write".into()],
            ..principal("org-a", "u1")
        };
        let service = Principal {
            permissions: vec!["channel:write".into(), "system:write".into()],
            ..principal("org-a", "svc")
        };

        let err = router
            .publish(
                &regular,
                "system_events",
                PublishOptions::event("maintenance", serde_json::json!({})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Auth(AuthError::Forbidden(_))));

        router
            .publish(
                &service,
                "system_events",
                PublishOptions::event("maintenance", serde_json::json!({})),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_system_channel_dispatch_still_tenant_filtered() {
        let router = test_router();
        let org_a = principal("org-a", "u1");
        let org_b = principal("org-b", "v1");

        let mut rx_a = subscribe(&router, &org_a, "s1", "system_events").await;
        let mut rx_b = subscribe(&router, &org_b, "s2", "system_events").await;

        let event = Event::new("maintenance", "system_events", serde_json::json!({}), "org-a");
        router.dispatch(&event).await.unwrap();

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backpressure_drops_fire_and_forget() {
        let router = router_with(ChannelConfig {
            max_outbound: 1,
            ..ChannelConfig::default()
        });
        let user = principal("org-a", "u1");
        let _rx = subscribe(&router, &user, "s1", "agent_events").await;

        let event = Event::new("x", "agent_events", serde_json::json!({}), "org-a");
        router.dispatch(&event).await.unwrap();
        // Queue full now; second dispatch drops silently
        router.dispatch(&event).await.unwrap();
        assert_eq!(router.backpressure_drops(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_fails_acknowledgment_events() {
        let router = router_with(ChannelConfig {
            max_outbound: 1,
            ..ChannelConfig::default()
        });
        let user = principal("org-a", "u1");
        let _rx = subscribe(&router, &user, "s1", "agent_events").await;

        let mut event = Event::new("x", "agent_events", serde_json::json!({}), "org-a");
        event.acknowledgment = true;

        router.dispatch(&event).await.unwrap();
        let err = router.dispatch(&event).await.unwrap_err();
        assert!(matches!(err, RealtimeError::Backpressure { .. }));
    }

    #[tokio::test]
    async fn test_ack_lifecycle() {
        let router = test_router();
        let user = principal("org-a", "u1");
        let mut rx = subscribe(&router, &user, "s1", "agent_events").await;

        let mut event = Event::new("x", "agent_events", serde_json::json!({}), "org-a");
        event.acknowledgment = true;
        router.dispatch(&event).await.unwrap();

        assert!(rx.try_recv().is_ok());
        assert_eq!(router.pending_ack_count(), 1);
        assert!(router.acknowledge("s1", &event.id));
        assert_eq!(router.pending_ack_count(), 0);
        assert!(!router.acknowledge("s1", &event.id));
    }

    #[tokio::test]
    async fn test_type_filter() {
        let router = test_router();
        let user = principal("org-a", "u1");
        let mut rx = router.register_session("s1", "org-a", Some("u1".into()));
        router
            .subscribe(
                &user,
                "s1",
                "agent_events",
                Some(serde_json::json!({"type": "agent_started"})),
                false,
            )
            .await
            .unwrap();

        let wanted = Event::new("agent_started", "agent_events", serde_json::json!({}), "org-a");
        let other = Event::new("agent_stopped", "agent_events", serde_json::json!({}), "org-a");
        router.dispatch(&other).await.unwrap();
        router.dispatch(&wanted).await.unwrap();

        let received = rx.try_recv().unwrap();
        assert_eq!(received.event_type, "agent_started");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_session_drains_everything() {
        let router = test_router();
        let user = principal("org-a", "u1");
        let _rx = subscribe(&router, &user, "s1", "agent_events").await;
        router
            .subscribe(&user, "s1", "tool_events", None, false)
            .await
            .unwrap();

        router.drop_session("s1");
        assert!(router.subscriptions_for("s1").is_empty());
        assert!(!router.has_sink("s1"));

        // Dispatch after teardown delivers nowhere and does not fail
        let event = Event::new("x", "agent_events", serde_json::json!({}), "org-a");
        router.dispatch(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_enqueues_and_worker_dispatches() {
        let router = test_router();
        router.inner.queue.init().await.unwrap();
        let user = principal("org-a", "u1");
        let mut rx = subscribe(&router, &user, "s1", "agent_events").await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = router.inner.queue.start_workers(
            QueueName::Normal,
            router.dispatch_handler(),
            shutdown_rx,
        );

        let event = router
            .publish(
                &user,
                "agent_events",
                PublishOptions::event("agent_started", serde_json::json!({"agent": "a1"})),
            )
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, event.id);
        assert_eq!(received.organization_id, "org-a");

        shutdown_tx.send(true).unwrap();
        futures::future::join_all(workers).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_retired_after_ttl() {
        let router = router_with(ChannelConfig {
            default_ttl_ms: 10_000,
            ..ChannelConfig::default()
        });
        let user = principal("org-a", "u1");
        let _rx = subscribe(&router, &user, "s1", "agent_events").await;
        assert_eq!(router.channel_count(), 1);

        router.unsubscribe("s1", "agent_events").unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = router.start_channel_sweeper(shutdown_rx);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(router.channel_count(), 0);

        shutdown_tx.send(true).unwrap();
        let _ = sweeper.await;
    }

    #[tokio::test]
    async fn test_high_priority_publish_routes_to_high_queue() {
        let router = test_router();
        router.inner.queue.init().await.unwrap();
        let user = principal("org-a", "u1");
        let _rx = subscribe(&router, &user, "s1", "agent_events").await;

        router
            .publish(
                &user,
                "agent_events",
                PublishOptions::event("urgent", serde_json::json!({})).priority(9),
            )
            .await
            .unwrap();

        let stats = router.inner.queue.stats().await.unwrap();
        assert_eq!(stats["high-priority"], 1);
        assert_eq!(stats["normal-priority"], 0);
    }
}
