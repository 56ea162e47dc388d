//! Message router and connection manager.
//!
//! Delivery forms: direct (one agent), multicast (a list), broadcast (`"*"`),
//! and channel fan-out. The transport for an agent is chosen from its
//! endpoint URL scheme: a live WebSocket connection when one exists, HTTP
//! POST one-shots, or the store's pub/sub as a fallback. Acknowledged
//! messages sit in a pending table and are retried with exponential backoff
//! until a response with a matching correlation id arrives.

use crate::config::{MessageConfig, WebSocketConfig};
use crate::events::{EventBus, SystemEvent};
use crate::types::{
    AgentId, Channel, ChannelConfig, ChannelType, Message, MessageType, Recipient,
};
use crate::OrchestrationError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use state_store::{keys, StateStore};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_MISSED_PONGS: u32 = 3;
const HISTORY_CAP: usize = 1_000;
const HISTORY_MAX_AGE_HOURS: i64 = 24;
const ACK_RETRY_BASE_MS: u64 = 1_000;
const RETRY_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Frame pushed to a connected agent's socket writer.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(Box<Message>),
    Ping,
    Close,
}

struct Connection {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    connected_at: DateTime<Utc>,
    missed_pongs: AtomicU32,
}

struct PendingDelivery {
    message: Message,
    attempts: u32,
    next_due: DateTime<Utc>,
    waiter: Option<oneshot::Sender<Message>>,
}

pub struct MessageRouter {
    config: MessageConfig,
    ws_config: WebSocketConfig,
    store: Arc<dyn StateStore>,
    events: EventBus,
    connections: DashMap<AgentId, Connection>,
    /// Routing table: agent id -> endpoint URLs, maintained by the registry owner.
    endpoints: DashMap<AgentId, Vec<String>>,
    channels: DashMap<String, Channel>,
    pending: DashMap<String, PendingDelivery>,
    history: Mutex<HashMap<String, VecDeque<Message>>>,
    http: reqwest::Client,
}

impl MessageRouter {
    pub fn new(
        config: MessageConfig,
        ws_config: WebSocketConfig,
        store: Arc<dyn StateStore>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ws_config,
            store,
            events,
            connections: DashMap::new(),
            endpoints: DashMap::new(),
            channels: DashMap::new(),
            pending: DashMap::new(),
            history: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        })
    }

    // -- routing table ------------------------------------------------------

    pub fn set_endpoints(&self, agent_id: &str, urls: Vec<String>) {
        self.endpoints.insert(agent_id.to_string(), urls);
    }

    pub fn remove_agent(&self, agent_id: &str) {
        self.endpoints.remove(agent_id);
        if self.connections.remove(agent_id).is_some() {
            self.events.emit(SystemEvent::AgentDisconnected {
                agent_id: agent_id.to_string(),
            });
        }
        for mut channel in self.channels.iter_mut() {
            channel.participants.remove(agent_id);
        }
    }

    // -- connections --------------------------------------------------------

    /// Attach a live connection for an agent; the returned receiver feeds the
    /// socket writer. An existing connection for the same agent is replaced.
    pub fn connect(
        &self,
        agent_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<OutboundFrame>, OrchestrationError> {
        if self.connections.len() >= self.ws_config.max_connections
            && !self.connections.contains_key(agent_id)
        {
            return Err(OrchestrationError::TransportFailure(format!(
                "connection limit reached ({})",
                self.ws_config.max_connections
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(old) = self.connections.insert(
            agent_id.to_string(),
            Connection {
                outbound: tx,
                connected_at: Utc::now(),
                missed_pongs: AtomicU32::new(0),
            },
        ) {
            let _ = old.outbound.send(OutboundFrame::Close);
            debug!(agent_id, "replaced existing connection");
        }

        info!(agent_id, "agent connected");
        self.events.emit(SystemEvent::AgentConnected {
            agent_id: agent_id.to_string(),
        });
        Ok(rx)
    }

    pub fn disconnect(&self, agent_id: &str) {
        if self.connections.remove(agent_id).is_some() {
            info!(agent_id, "agent disconnected");
            self.events.emit(SystemEvent::AgentDisconnected {
                agent_id: agent_id.to_string(),
            });
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.connections.contains_key(agent_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn record_pong(&self, agent_id: &str) {
        if let Some(conn) = self.connections.get(agent_id) {
            conn.missed_pongs.store(0, Ordering::Relaxed);
        }
    }

    /// Ping every connection; evict those that missed three pongs in a row.
    pub fn heartbeat_tick(&self) {
        let mut evicted = Vec::new();
        for conn in self.connections.iter() {
            let missed = conn.missed_pongs.fetch_add(1, Ordering::Relaxed);
            if missed >= MAX_MISSED_PONGS {
                evicted.push(conn.key().clone());
            } else if conn.outbound.send(OutboundFrame::Ping).is_err() {
                evicted.push(conn.key().clone());
            }
        }
        for agent_id in evicted {
            warn!(agent_id = %agent_id, "connection evicted after missed pongs");
            if let Some((_, conn)) = self.connections.remove(&agent_id) {
                let _ = conn.outbound.send(OutboundFrame::Close);
            }
            self.events.emit(SystemEvent::AgentDisconnected { agent_id });
        }
    }

    // -- channels -----------------------------------------------------------

    pub async fn create_channel(
        &self,
        name: &str,
        channel_type: ChannelType,
        config: ChannelConfig,
    ) -> Result<Channel, OrchestrationError> {
        let channel = Channel {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            channel_type,
            participants: HashSet::new(),
            config,
            created: Utc::now(),
        };
        self.persist_channel(&channel).await?;
        self.channels.insert(channel.id.clone(), channel.clone());
        info!(channel_id = %channel.id, name, "channel created");
        Ok(channel)
    }

    pub async fn join_channel(
        &self,
        channel_id: &str,
        agent_id: &str,
    ) -> Result<(), OrchestrationError> {
        let Some(mut channel) = self.channels.get_mut(channel_id) else {
            return Err(OrchestrationError::NotFound(format!(
                "channel {}",
                channel_id
            )));
        };
        channel.participants.insert(agent_id.to_string());
        let snapshot = channel.clone();
        drop(channel);
        self.persist_channel(&snapshot).await
    }

    pub async fn leave_channel(
        &self,
        channel_id: &str,
        agent_id: &str,
    ) -> Result<(), OrchestrationError> {
        let Some(mut channel) = self.channels.get_mut(channel_id) else {
            return Err(OrchestrationError::NotFound(format!(
                "channel {}",
                channel_id
            )));
        };
        channel.participants.remove(agent_id);
        let snapshot = channel.clone();
        drop(channel);
        self.persist_channel(&snapshot).await
    }

    pub fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels.get(channel_id).map(|c| c.clone())
    }

    async fn persist_channel(&self, channel: &Channel) -> Result<(), OrchestrationError> {
        let json = serde_json::to_string(channel)?;
        self.store.put(&keys::channel(&channel.id), &json, None).await?;
        Ok(())
    }

    // -- sending ------------------------------------------------------------

    /// Route and deliver a message. Acknowledged messages are retained for
    /// retry until the matching response arrives or the budget runs out.
    pub async fn send(&self, mut message: Message) -> Result<(), OrchestrationError> {
        let serialized = serde_json::to_string(&message)?;
        if serialized.len() > self.config.max_size_bytes {
            return Err(OrchestrationError::MessageTooLarge {
                size: serialized.len(),
                max: self.config.max_size_bytes,
            });
        }

        if message.requires_ack && message.max_retries == 0 {
            message.max_retries = self.config.max_retries.max(1);
        }

        let recipients = self.resolve_recipients(&message)?;
        if recipients.is_empty() {
            debug!(message_id = %message.message_id, "message resolved to no recipients");
        }

        if message.requires_ack {
            self.pending.insert(
                message.message_id.clone(),
                PendingDelivery {
                    message: message.clone(),
                    attempts: 0,
                    next_due: Utc::now() + ChronoDuration::milliseconds(ACK_RETRY_BASE_MS as i64),
                    waiter: None,
                },
            );
        }

        self.record_history(&message);
        for agent_id in &recipients {
            if let Err(e) = self.deliver(agent_id, &message).await {
                warn!(message_id = %message.message_id, agent_id = %agent_id, "delivery failed: {}", e);
                if !message.requires_ack {
                    self.events.emit(SystemEvent::MessageDeliveryFailed {
                        message_id: message.message_id.clone(),
                        to: agent_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Send a request and wait for the correlated response.
    pub async fn request(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, OrchestrationError> {
        message.requires_ack = true;
        if message.max_retries == 0 {
            message.max_retries = self.config.max_retries.max(1);
        }
        let message_id = message.message_id.clone();
        let (tx, rx) = oneshot::channel();

        let serialized = serde_json::to_string(&message)?;
        if serialized.len() > self.config.max_size_bytes {
            return Err(OrchestrationError::MessageTooLarge {
                size: serialized.len(),
                max: self.config.max_size_bytes,
            });
        }
        let recipients = self.resolve_recipients(&message)?;

        self.pending.insert(
            message_id.clone(),
            PendingDelivery {
                message: message.clone(),
                attempts: 0,
                next_due: Utc::now() + ChronoDuration::milliseconds(ACK_RETRY_BASE_MS as i64),
                waiter: Some(tx),
            },
        );

        self.record_history(&message);
        for agent_id in &recipients {
            if let Err(e) = self.deliver(agent_id, &message).await {
                debug!(message_id = %message_id, "initial delivery failed, retry loop will follow: {}", e);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.remove(&message_id);
                Err(OrchestrationError::TransportFailure(
                    "delivery abandoned".to_string(),
                ))
            }
            Err(_) => {
                self.pending.remove(&message_id);
                Err(OrchestrationError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Entry point for frames arriving from a connected agent.
    pub async fn handle_incoming(&self, from: &str, message: Message) {
        self.record_history(&message);

        // Correlated response: settle the pending delivery. When the control
        // plane itself awaits the response, hand it over and stop; an
        // agent-to-agent ack still gets relayed below.
        if message.message_type == MessageType::Response {
            if let Some(correlation_id) = &message.correlation_id {
                if let Some((_, pending)) = self.pending.remove(correlation_id) {
                    debug!(message_id = %correlation_id, "acknowledged");
                    if let Some(waiter) = pending.waiter {
                        let _ = waiter.send(message.clone());
                        return;
                    }
                }
            }
        }

        // Ack requested by the sender: answer with a system response.
        if message.requires_ack {
            let ack = Message::ack_for(&message, "system");
            if let Err(e) = self.deliver(from, &ack).await {
                debug!(agent_id = %from, "failed to deliver ack: {}", e);
            }
        }

        // Relay messages addressed beyond the control plane.
        let addressed_elsewhere = match &message.to {
            Some(Recipient::One(id)) => id != "system" && !id.is_empty(),
            Some(Recipient::Many(_)) => true,
            None => message.channel.is_some(),
        };
        if addressed_elsewhere {
            if let Err(e) = Box::pin(self.send(message)).await {
                warn!("failed to relay message: {}", e);
            }
        }
    }

    fn resolve_recipients(&self, message: &Message) -> Result<Vec<AgentId>, OrchestrationError> {
        if let Some(channel_id) = &message.channel {
            let Some(channel) = self.channels.get(channel_id) else {
                return Err(OrchestrationError::NotFound(format!(
                    "channel {}",
                    channel_id
                )));
            };
            // Participants without endpoints are skipped silently.
            return Ok(channel
                .participants
                .iter()
                .filter(|id| {
                    self.endpoints.contains_key(*id) || self.connections.contains_key(*id)
                })
                .filter(|id| *id != &message.from)
                .cloned()
                .collect());
        }

        match &message.to {
            Some(recipient) if recipient.is_broadcast() => {
                let mut all: HashSet<AgentId> = self
                    .endpoints
                    .iter()
                    .map(|e| e.key().clone())
                    .collect();
                all.extend(self.connections.iter().map(|c| c.key().clone()));
                all.remove(&message.from);
                Ok(all.into_iter().collect())
            }
            Some(Recipient::One(id)) => Ok(vec![id.clone()]),
            Some(Recipient::Many(ids)) => Ok(ids.clone()),
            None => Ok(Vec::new()),
        }
    }

    /// Transport selection: live socket first, then the first usable
    /// endpoint by URL scheme.
    async fn deliver(&self, agent_id: &str, message: &Message) -> Result<(), OrchestrationError> {
        if let Some(conn) = self.connections.get(agent_id) {
            return conn
                .outbound
                .send(OutboundFrame::Message(Box::new(message.clone())))
                .map_err(|_| {
                    OrchestrationError::TransportFailure(format!(
                        "connection to {} closed",
                        agent_id
                    ))
                });
        }

        let urls = self
            .endpoints
            .get(agent_id)
            .map(|e| e.clone())
            .unwrap_or_default();
        if urls.is_empty() {
            return Err(OrchestrationError::NotFound(format!(
                "no endpoints for agent {}",
                agent_id
            )));
        }

        for url in &urls {
            if url.starts_with("http://") || url.starts_with("https://") {
                let response = self
                    .http
                    .post(url)
                    .json(message)
                    .timeout(Duration::from_millis(self.config.default_timeout_ms))
                    .send()
                    .await
                    .map_err(|e| OrchestrationError::TransportFailure(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(OrchestrationError::TransportFailure(format!(
                        "agent endpoint returned {}",
                        response.status()
                    )));
                }
                return Ok(());
            }
            if url.starts_with("redis://") || url.starts_with("pubsub://") {
                let payload = serde_json::to_string(message)?;
                self.store
                    .publish(&format!("agent:events:{}", agent_id), &payload)
                    .await?;
                return Ok(());
            }
        }

        Err(OrchestrationError::TransportFailure(format!(
            "agent {} has no reachable transport (not connected)",
            agent_id
        )))
    }

    // -- retries ------------------------------------------------------------

    /// Retry due pending deliveries with exponential backoff; drop those out
    /// of budget and emit `messageDeliveryFailed`.
    pub async fn retry_tick(&self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|p| p.next_due <= now)
            .map(|p| p.key().clone())
            .collect();

        for message_id in due {
            let retry_message = {
                let Some(mut pending) = self.pending.get_mut(&message_id) else {
                    continue;
                };
                pending.attempts += 1;
                pending.message.retry_count = pending.attempts;
                if pending.attempts > pending.message.max_retries
                    || pending.message.expired(now)
                {
                    None
                } else {
                    let backoff = ACK_RETRY_BASE_MS * 2u64.pow(pending.attempts.min(16));
                    pending.next_due = now + ChronoDuration::milliseconds(backoff as i64);
                    Some(pending.message.clone())
                }
            };

            let Some(message) = retry_message else {
                if let Some((_, pending)) = self.pending.remove(&message_id) {
                    let to = match &pending.message.to {
                        Some(Recipient::One(id)) => id.clone(),
                        _ => "*".to_string(),
                    };
                    warn!(message_id = %message_id, "message dropped after retry budget");
                    self.events.emit(SystemEvent::MessageDeliveryFailed {
                        message_id,
                        to,
                    });
                }
                continue;
            };

            if let Ok(recipients) = self.resolve_recipients(&message) {
                for agent_id in recipients {
                    if let Err(e) = self.deliver(&agent_id, &message).await {
                        debug!(message_id = %message.message_id, "retry delivery failed: {}", e);
                    }
                }
            }
        }
    }

    /// Heartbeat + retry loops; exits on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ping = tokio::time::interval(Duration::from_millis(
            self.ws_config.ping_interval_ms.max(100),
        ));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut retry = tokio::time::interval(RETRY_SCAN_INTERVAL);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => self.heartbeat_tick(),
                _ = retry.tick() => {
                    self.retry_tick().await;
                    self.prune_history();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("router loops stopped");
                        return;
                    }
                }
            }
        }
    }

    // -- history ------------------------------------------------------------

    fn record_history(&self, message: &Message) {
        let mut history = self.history.lock();
        let mut keys_for = vec![format!("from:{}", message.from)];
        match &message.to {
            Some(Recipient::One(id)) => keys_for.push(format!("to:{}", id)),
            Some(Recipient::Many(ids)) => {
                keys_for.extend(ids.iter().map(|id| format!("to:{}", id)))
            }
            None => {}
        }
        if let Some(channel) = &message.channel {
            keys_for.push(format!("channel:{}", channel));
        }

        for key in keys_for {
            let entries = history.entry(key).or_default();
            entries.push_back(message.clone());
            while entries.len() > HISTORY_CAP {
                entries.pop_front();
            }
        }
    }

    fn prune_history(&self) {
        let cutoff = Utc::now() - ChronoDuration::hours(HISTORY_MAX_AGE_HOURS);
        let mut history = self.history.lock();
        for entries in history.values_mut() {
            while entries
                .front()
                .is_some_and(|m| m.timestamp < cutoff)
            {
                entries.pop_front();
            }
        }
        history.retain(|_, entries| !entries.is_empty());
    }

    pub fn history_for(&self, key: &str, limit: usize) -> Vec<Message> {
        self.history
            .lock()
            .get(key)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn connected_since(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.connections.get(agent_id).map(|c| c.connected_at)
    }
}
