use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use async_trait::async_trait;

use crate::exchange::{
    ExchangeClient, ExchangeError, ExchangeEvent, OrderAck, OrderStatusReport, VenueStatus,
};
use crate::models::{Fill, OrderPlan, OrderSide, OrderType};

const MAX_RETRIES: u32 = 3;
const POLL_INTERVAL_SECS: u64 = 2;
const EVENT_CHANNEL_DEPTH: usize = 64;

// Type alias for the rate limiter to simplify signatures
type VenueRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Serialize)]
struct PlaceOrderRequest<'a> {
    client_order_id: String,
    symbol: &'a str,
    side: &'static str,
    quantity: f64,
    order_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    order_id: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    order_id: String,
    status: String,
    #[serde(default)]
    fills: Vec<VenueFill>,
}

#[derive(Debug, Deserialize)]
struct VenueFill {
    fill_id: String,
    price: f64,
    quantity: f64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
}

/// HTTP venue client.
///
/// The venue keys orders on `client_order_id`, so resubmitting the same plan
/// after a transport failure returns the already-placed order instead of
/// creating a duplicate. The event stream is synthesized by polling order
/// status and diffing fills against what has already been emitted.
#[derive(Clone)]
pub struct RestExchange {
    client: Client,
    base_url: String,
    rate_limiter: Arc<VenueRateLimiter>,
    /// Orders this client has placed and not yet seen reach a terminal state
    tracked: Arc<Mutex<HashSet<String>>>,
    /// Fill ids already emitted on the event stream, per order
    emitted: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl RestExchange {
    pub fn new(base_url: String, timeout_secs: u64, max_requests_per_minute: u32) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client");

        let quota =
            Quota::per_minute(NonZeroU32::new(max_requests_per_minute.max(1)).unwrap());

        Self {
            client,
            base_url,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            tracked: Arc::new(Mutex::new(HashSet::new())),
            emitted: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Rate-limited GET with retry on 429/5xx
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, ExchangeError> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            "Venue returned {}, backing off {}s (attempt {}/{})",
                            status,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    return Err(ExchangeError::Transport(format!(
                        "venue returned {status} for {url}"
                    )));
                }
                Err(e) => {
                    if attempt == MAX_RETRIES {
                        return Err(ExchangeError::Transport(e.to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }

        Err(ExchangeError::Transport(format!(
            "retries exhausted for {url}"
        )))
    }

    fn status_from_str(status: &str) -> VenueStatus {
        match status {
            "filled" => VenueStatus::Filled,
            "canceled" => VenueStatus::Canceled,
            "rejected" => VenueStatus::Rejected,
            _ => VenueStatus::Open,
        }
    }

    /// One polling pass: diff venue fills against what has been emitted
    async fn poll_once(&self, tx: &mpsc::Sender<ExchangeEvent>) -> Result<(), ExchangeError> {
        let order_ids: Vec<String> = self.tracked.lock().unwrap().iter().cloned().collect();

        for order_id in order_ids {
            let report = self.order_status(&order_id).await?;

            let fresh: Vec<Fill> = {
                let mut emitted = self.emitted.lock().unwrap();
                let seen = emitted.entry(order_id.clone()).or_default();
                report
                    .fills
                    .iter()
                    .filter(|f| seen.insert(f.fill_id.clone()))
                    .cloned()
                    .collect()
            };

            for fill in fresh {
                if tx
                    .send(ExchangeEvent::Fill {
                        exchange_order_id: order_id.clone(),
                        fill,
                    })
                    .await
                    .is_err()
                {
                    return Ok(()); // subscriber gone
                }
            }

            match report.status {
                VenueStatus::Canceled => {
                    let _ = tx
                        .send(ExchangeEvent::Canceled {
                            exchange_order_id: order_id.clone(),
                        })
                        .await;
                    self.untrack(&order_id);
                }
                VenueStatus::Filled | VenueStatus::Rejected => self.untrack(&order_id),
                VenueStatus::Open => {}
            }
        }

        Ok(())
    }

    fn untrack(&self, order_id: &str) {
        self.tracked.lock().unwrap().remove(order_id);
        self.emitted.lock().unwrap().remove(order_id);
    }
}

#[async_trait]
impl ExchangeClient for RestExchange {
    async fn place_order(&self, plan: &OrderPlan) -> Result<OrderAck, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let request = PlaceOrderRequest {
            client_order_id: plan.plan_id.to_string(),
            symbol: &plan.symbol,
            side: match plan.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            quantity: plan.quantity,
            order_type: match plan.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            price: plan.price_limit,
        };

        let url = format!("{}/orders", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(ExchangeError::Transport(format!("venue {status}: {body}")));
            }
            return Err(ExchangeError::Rejected(format!("venue {status}: {body}")));
        }

        let ack: PlaceOrderResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if ack.status == "rejected" {
            return Err(ExchangeError::Rejected(
                ack.reason.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }

        self.tracked.lock().unwrap().insert(ack.order_id.clone());

        Ok(OrderAck {
            exchange_order_id: ack.order_id,
        })
    }

    async fn order_status(
        &self,
        exchange_order_id: &str,
    ) -> Result<OrderStatusReport, ExchangeError> {
        let url = format!("{}/orders/{}", self.base_url, exchange_order_id);
        let response = self.get_with_retry(&url).await?;

        let body: OrderStatusResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Ok(OrderStatusReport {
            exchange_order_id: body.order_id,
            status: Self::status_from_str(&body.status),
            fills: body
                .fills
                .into_iter()
                .map(|f| Fill {
                    fill_id: f.fill_id,
                    price: f.price,
                    quantity: f.quantity,
                    timestamp: f.timestamp,
                })
                .collect(),
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/price/{}", self.base_url, symbol);
        let response = self.get_with_retry(&url).await?;

        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Ok(body.price)
    }

    async fn reconnect(&self) -> Result<(), ExchangeError> {
        // Stateless HTTP: verify the venue answers before resuming
        let url = format!("{}/ping", self.base_url);
        self.get_with_retry(&url).await.map(|_| ())
    }

    fn subscribe(&self) -> mpsc::Receiver<ExchangeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let venue = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(POLL_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                if let Err(e) = venue.poll_once(&tx).await {
                    tracing::warn!("Order poll failed: {}", e);
                    let _ = tx.send(ExchangeEvent::Disconnected).await;
                    break;
                }
            }
        });

        rx
    }
}
