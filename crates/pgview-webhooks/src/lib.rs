//! Webhook Delivery for View Events
//!
//! Fans view change events out to registered HTTP endpoints:
//! - Endpoint registry filtered by event type
//! - Delivery state machine with capped exponential backoff
//! - Scheduler driving due retries

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pgview_common::config::WebhookConfig;
use pgview_views::{ViewEvent, ViewEventSink};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("cannot {action} a delivery in state {from:?}")]
    InvalidTransition {
        from: DeliveryState,
        action: &'static str,
    },

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Event types an endpoint can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "view.created")]
    ViewCreated,
    #[serde(rename = "view.updated")]
    ViewUpdated,
    #[serde(rename = "view.version_recorded")]
    VersionRecorded,
}

impl From<&ViewEvent> for WebhookEvent {
    fn from(event: &ViewEvent) -> Self {
        match event {
            ViewEvent::Created { .. } => Self::ViewCreated,
            ViewEvent::Updated { .. } => Self::ViewUpdated,
            ViewEvent::VersionRecorded { .. } => Self::VersionRecorded,
        }
    }
}

/// Registered receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub events: Vec<WebhookEvent>,
    pub headers: HashMap<String, String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: url.to_string(),
            events: vec![
                WebhookEvent::ViewCreated,
                WebhookEvent::ViewUpdated,
                WebhookEvent::VersionRecorded,
            ],
            headers: HashMap::new(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: Vec<WebhookEvent>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }
}

/// Delivery lifecycle.
///
/// `Pending -> Success | Failed | Abandoned`; `Failed -> Pending` once its
/// retry time has passed. `Success` and `Abandoned` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Success,
    Failed,
    Abandoned,
}

/// Result of one POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered { status: u16 },
    Rejected { status: u16 },
    TransportError(String),
}

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&WebhookConfig> for RetryPolicy {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Wait after the `attempt`-th failed attempt (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// One event bound for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event: WebhookEvent,
    pub payload: serde_json::Value,
    pub state: DeliveryState,
    pub attempts: u32,
    pub next_retry: Option<DateTime<Utc>>,
    pub last_response_status: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    pub fn new(endpoint_id: Uuid, event: WebhookEvent, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint_id,
            event,
            payload,
            state: DeliveryState::Pending,
            attempts: 0,
            next_retry: None,
            last_response_status: None,
            last_error: None,
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    /// Apply the outcome of an attempt made while `Pending`.
    ///
    /// # Errors
    /// Returns `WebhookError::InvalidTransition` from any other state.
    pub fn record_attempt(
        &mut self,
        outcome: AttemptOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<DeliveryState, WebhookError> {
        if self.state != DeliveryState::Pending {
            return Err(WebhookError::InvalidTransition {
                from: self.state,
                action: "record an attempt on",
            });
        }
        self.attempts += 1;

        match outcome {
            AttemptOutcome::Delivered { status } => {
                self.last_response_status = Some(status);
                self.last_error = None;
                self.next_retry = None;
                self.delivered_at = Some(now);
                self.state = DeliveryState::Success;
                return Ok(self.state);
            }
            AttemptOutcome::Rejected { status } => {
                self.last_response_status = Some(status);
                self.last_error = Some(format!("endpoint responded with status {status}"));
            }
            AttemptOutcome::TransportError(message) => {
                self.last_response_status = None;
                self.last_error = Some(message);
            }
        }

        if self.attempts >= policy.max_attempts {
            self.next_retry = None;
            self.state = DeliveryState::Abandoned;
        } else {
            let delay_ms = policy.backoff(self.attempts).as_millis();
            let delay = chrono::Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX));
            self.next_retry = Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
            self.state = DeliveryState::Failed;
        }
        Ok(self.state)
    }

    /// Move a `Failed` delivery back to `Pending` once its retry time passed.
    /// Returns whether the delivery is now pending.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> bool {
        let due = self.next_retry.is_some_and(|at| at <= now);
        if self.state == DeliveryState::Failed && due {
            self.state = DeliveryState::Pending;
            self.next_retry = None;
            true
        } else {
            false
        }
    }

    /// Give up without another attempt
    fn abandon(&mut self, reason: impl Into<String>) {
        self.state = DeliveryState::Abandoned;
        self.next_retry = None;
        self.last_error = Some(reason.into());
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, DeliveryState::Success | DeliveryState::Abandoned)
    }
}

/// Open deliveries keyed by id, plus a capped tail of finished ones
#[derive(Debug, Default)]
struct DeliveryLog {
    open: HashMap<Uuid, WebhookDelivery>,
    finished: VecDeque<WebhookDelivery>,
    history_limit: usize,
}

impl DeliveryLog {
    fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            ..Default::default()
        }
    }

    fn get(&self, id: Uuid) -> Option<&WebhookDelivery> {
        self.open
            .get(&id)
            .or_else(|| self.finished.iter().find(|d| d.id == id))
    }

    fn finish(&mut self, id: Uuid) {
        if let Some(delivery) = self.open.remove(&id) {
            self.finished.push_back(delivery);
            while self.finished.len() > self.history_limit {
                self.finished.pop_front();
            }
        }
    }
}

/// Sends one payload to one endpoint
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, endpoint: &WebhookEndpoint, body: &serde_json::Value) -> AttemptOutcome;
}

/// HTTP transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// # Errors
    /// Returns `WebhookError::Client` when the HTTP client cannot be built.
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post(&self, endpoint: &WebhookEndpoint, body: &serde_json::Value) -> AttemptOutcome {
        let mut request = self.client.post(&endpoint.url).json(body);
        for (key, value) in &endpoint.headers {
            request = request.header(key, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => AttemptOutcome::Delivered {
                status: response.status().as_u16(),
            },
            Ok(response) => AttemptOutcome::Rejected {
                status: response.status().as_u16(),
            },
            Err(e) => AttemptOutcome::TransportError(e.to_string()),
        }
    }
}

/// What one scheduler pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

/// Webhook manager
pub struct WebhookManager {
    endpoints: Arc<RwLock<HashMap<Uuid, WebhookEndpoint>>>,
    deliveries: Arc<RwLock<DeliveryLog>>,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
    /// Serializes scheduler passes so a delivery is never posted twice
    tick_lock: tokio::sync::Mutex<()>,
}

impl WebhookManager {
    pub fn new(transport: Arc<dyn WebhookTransport>, config: &WebhookConfig) -> Self {
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            deliveries: Arc::new(RwLock::new(DeliveryLog::new(config.history_limit))),
            transport,
            policy: RetryPolicy::from(config),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register an endpoint
    pub fn register(&self, endpoint: WebhookEndpoint) {
        info!(endpoint = %endpoint.name, url = %endpoint.url, "Registered webhook endpoint");
        self.endpoints.write().insert(endpoint.id, endpoint);
    }

    /// Unregister an endpoint; its undelivered events are abandoned on the
    /// next pass
    pub fn unregister(&self, id: Uuid) -> Option<WebhookEndpoint> {
        self.endpoints.write().remove(&id)
    }

    /// List all endpoints
    pub fn list(&self) -> Vec<WebhookEndpoint> {
        self.endpoints.read().values().cloned().collect()
    }

    /// Enabled endpoints subscribed to `event`
    pub fn endpoints_for(&self, event: WebhookEvent) -> Vec<WebhookEndpoint> {
        self.endpoints
            .read()
            .values()
            .filter(|e| e.enabled && e.events.contains(&event))
            .cloned()
            .collect()
    }

    /// Queue `payload` for every subscribed endpoint
    pub fn enqueue(&self, event: WebhookEvent, payload: &serde_json::Value) -> Vec<Uuid> {
        let fresh: Vec<_> = self
            .endpoints_for(event)
            .into_iter()
            .map(|endpoint| WebhookDelivery::new(endpoint.id, event, payload.clone()))
            .collect();
        let ids = fresh.iter().map(|d| d.id).collect();
        let mut log = self.deliveries.write();
        for delivery in fresh {
            log.open.insert(delivery.id, delivery);
        }
        ids
    }

    /// Open and retained deliveries of one endpoint, newest first
    pub fn deliveries(&self, endpoint_id: Uuid, limit: usize) -> Vec<WebhookDelivery> {
        let log = self.deliveries.read();
        let mut found: Vec<_> = log
            .open
            .values()
            .chain(log.finished.iter())
            .filter(|d| d.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        found
    }

    pub fn delivery(&self, id: Uuid) -> Option<WebhookDelivery> {
        self.deliveries.read().get(id).cloned()
    }

    /// Deliveries still waiting for an attempt or a retry
    #[must_use]
    pub fn open_deliveries(&self) -> usize {
        self.deliveries.read().open.len()
    }

    /// Requeue due retries, then attempt every pending delivery once
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let _pass = self.tick_lock.lock().await;
        let mut summary = TickSummary::default();

        let batch: Vec<(Uuid, WebhookEndpoint, serde_json::Value)> = {
            let endpoints = self.endpoints.read();
            let mut log = self.deliveries.write();
            let mut batch = Vec::new();
            let mut gone = Vec::new();
            for delivery in log.open.values_mut() {
                if !(delivery.requeue(now) || delivery.state == DeliveryState::Pending) {
                    continue;
                }
                match endpoints.get(&delivery.endpoint_id) {
                    Some(endpoint) if endpoint.enabled => {
                        batch.push((delivery.id, endpoint.clone(), delivery.payload.clone()));
                    }
                    Some(_) => {
                        delivery.abandon("endpoint is disabled");
                        gone.push(delivery.id);
                    }
                    None => {
                        delivery.abandon("endpoint is no longer registered");
                        gone.push(delivery.id);
                    }
                }
            }
            summary.abandoned += gone.len();
            for id in gone {
                log.finish(id);
            }
            batch
        };

        for (id, endpoint, payload) in batch {
            let outcome = self.transport.post(&endpoint, &payload).await;

            let mut log = self.deliveries.write();
            let Some(delivery) = log.open.get_mut(&id) else {
                continue;
            };

            summary.attempted += 1;
            match delivery.record_attempt(outcome, &self.policy, now) {
                Ok(DeliveryState::Success) => summary.succeeded += 1,
                Ok(DeliveryState::Abandoned) => {
                    warn!(
                        delivery = %id,
                        attempts = delivery.attempts,
                        error = ?delivery.last_error,
                        "Webhook delivery abandoned"
                    );
                    summary.abandoned += 1;
                }
                Ok(_) => {
                    debug!(delivery = %id, next_retry = ?delivery.next_retry, "Webhook delivery failed");
                    summary.failed += 1;
                }
                Err(e) => warn!(delivery = %id, error = %e, "Skipped webhook delivery"),
            }
            if delivery.is_finished() {
                log.finish(id);
            }
        }
        summary
    }

    /// Run [`WebhookManager::tick`] every `interval` until the task is
    /// aborted
    pub fn spawn_scheduler(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let summary = self.tick(Utc::now()).await;
                if summary.attempted > 0 || summary.abandoned > 0 {
                    debug!(?summary, "Webhook scheduler pass");
                }
            }
        })
    }
}

/// Body posted for a view event
fn envelope(event: &ViewEvent) -> serde_json::Value {
    serde_json::json!({
        "type": event.event_name(),
        "subject": event.subject(),
        "occurredAt": Utc::now(),
        "data": event,
    })
}

#[async_trait]
impl ViewEventSink for WebhookManager {
    async fn publish(&self, event: ViewEvent) {
        let ids = self.enqueue(WebhookEvent::from(&event), &envelope(&event));
        debug!(event = event.event_name(), deliveries = ids.len(), "Queued webhook deliveries");
    }
}
