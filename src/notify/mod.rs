use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::extract::RejectReason;
use crate::models::{OrderSide, OrderState, Position};
use crate::risk::DenyReason;

/// Material pipeline outcomes pushed to the notification collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    IntentApproved {
        symbol: String,
        plan_id: Uuid,
        side: OrderSide,
        quantity: f64,
    },
    IntentDenied {
        symbol: String,
        intent_id: Uuid,
        reason: DenyReason,
    },
    SignalDropped {
        source_id: String,
        reason: RejectReason,
    },
    OrderTerminal {
        symbol: String,
        order_id: Uuid,
        state: OrderState,
        filled_quantity: f64,
    },
    StageDegraded {
        stage: String,
        error: String,
    },
}

/// Outbound notification seam. Implementations must never block the
/// pipeline: failures are logged and swallowed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &PipelineEvent);
}

/// Discards everything; used when no webhook is configured
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _event: &PipelineEvent) {}
}

/// Posts events as JSON to a messaging webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client");
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &PipelineEvent) {
        match self.client.post(&self.url).json(event).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!("Webhook returned {} for {:?}", response.status(), event);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Webhook delivery failed: {} ({:?})", e, event);
            }
        }
    }
}

/// Health of one supervised stage as shown to the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub name: String,
    pub state: String,
    pub restarts: u32,
}

/// Point-in-time pipeline state pushed on every material change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub timestamp: DateTime<Utc>,
    pub stages: Vec<StageStatus>,
    pub positions: Vec<Position>,
    pub in_flight_orders: usize,
}

/// Dashboard seam: a passive subscriber with no write access to core state
pub trait StatePublisher: Send + Sync {
    fn publish_state(&self, snapshot: &PipelineSnapshot);
}

/// Default publisher: structured log lines, which is all the terminal
/// dashboard needs
pub struct LogPublisher;

impl StatePublisher for LogPublisher {
    fn publish_state(&self, snapshot: &PipelineSnapshot) {
        tracing::info!(
            "Pipeline state: {} stages, {} positions, {} in-flight orders",
            snapshot.stages.len(),
            snapshot.positions.len(),
            snapshot.in_flight_orders
        );
    }
}
