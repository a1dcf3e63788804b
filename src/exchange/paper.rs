use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use async_trait::async_trait;

use crate::exchange::{
    ExchangeClient, ExchangeError, ExchangeEvent, OrderAck, OrderStatusReport, VenueStatus,
};
use crate::models::{Fill, OrderPlan};

const EVENT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
struct PaperOrder {
    #[allow(dead_code)]
    client_order_id: Uuid,
    #[allow(dead_code)]
    symbol: String,
    quantity: f64,
    status: VenueStatus,
    fills: Vec<Fill>,
}

#[derive(Default)]
struct PaperState {
    orders: HashMap<String, PaperOrder>,
    /// client order id -> exchange order id, the idempotency map
    by_client: HashMap<Uuid, String>,
    prices: HashMap<String, f64>,
    /// Scripted transport failures for the next N placements
    fail_placements: u32,
    event_tx: Option<mpsc::Sender<ExchangeEvent>>,
}

/// Deterministic in-memory venue used for paper trading and tests.
///
/// Orders are accepted immediately; fills are injected by the caller
/// (`push_fill`), so tests control the exact event sequence the pipeline
/// observes.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    next_id: AtomicU64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock().unwrap();
        state.prices.insert(symbol.to_string(), price);
    }

    /// Script the next `n` placements to fail at the transport layer
    pub fn fail_next_placements(&self, n: u32) {
        self.state.lock().unwrap().fail_placements = n;
    }

    /// Exchange order id placed for a client order, if any
    pub fn exchange_id_for(&self, client_order_id: Uuid) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .by_client
            .get(&client_order_id)
            .cloned()
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }

    /// Record a fill against an order and push it on the event stream.
    /// Marks the order Filled once cumulative quantity reaches its size.
    pub async fn push_fill(&self, exchange_order_id: &str, price: f64, quantity: f64) {
        let (fill, tx) = {
            let mut state = self.state.lock().unwrap();
            let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
            let order = state
                .orders
                .get_mut(exchange_order_id)
                .unwrap_or_else(|| panic!("no such paper order {exchange_order_id}"));

            let fill = Fill {
                fill_id: format!("pf-{seq}"),
                price,
                quantity,
                timestamp: Utc::now(),
            };
            order.fills.push(fill.clone());

            let done: f64 = order.fills.iter().map(|f| f.quantity).sum();
            if done >= order.quantity {
                order.status = VenueStatus::Filled;
            }

            (fill, state.event_tx.clone())
        };

        if let Some(tx) = tx {
            let _ = tx
                .send(ExchangeEvent::Fill {
                    exchange_order_id: exchange_order_id.to_string(),
                    fill,
                })
                .await;
        }
    }

    /// Record a fill without emitting an event, as if it happened while the
    /// feed was down; visible only through `order_status`
    pub fn record_silent_fill(&self, exchange_order_id: &str, price: f64, quantity: f64) {
        let mut state = self.state.lock().unwrap();
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order = state
            .orders
            .get_mut(exchange_order_id)
            .unwrap_or_else(|| panic!("no such paper order {exchange_order_id}"));

        order.fills.push(Fill {
            fill_id: format!("pf-{seq}"),
            price,
            quantity,
            timestamp: Utc::now(),
        });

        let done: f64 = order.fills.iter().map(|f| f.quantity).sum();
        if done >= order.quantity {
            order.status = VenueStatus::Filled;
        }
    }

    /// Drop the event stream, signalling a disconnect to the subscriber
    pub async fn drop_feed(&self) {
        let tx = self.state.lock().unwrap().event_tx.take();
        if let Some(tx) = tx {
            let _ = tx.send(ExchangeEvent::Disconnected).await;
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn place_order(&self, plan: &OrderPlan) -> Result<OrderAck, ExchangeError> {
        let mut state = self.state.lock().unwrap();

        if state.fail_placements > 0 {
            state.fail_placements -= 1;
            return Err(ExchangeError::Transport("connection reset".to_string()));
        }

        // Idempotent on client order id
        if let Some(existing) = state.by_client.get(&plan.plan_id) {
            return Ok(OrderAck {
                exchange_order_id: existing.clone(),
            });
        }

        if !state.prices.contains_key(&plan.symbol) {
            return Err(ExchangeError::Rejected(format!(
                "unknown symbol {}",
                plan.symbol
            )));
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let exchange_order_id = format!("px-{seq}");

        state.orders.insert(
            exchange_order_id.clone(),
            PaperOrder {
                client_order_id: plan.plan_id,
                symbol: plan.symbol.clone(),
                quantity: plan.quantity,
                status: VenueStatus::Open,
                fills: Vec::new(),
            },
        );
        state
            .by_client
            .insert(plan.plan_id, exchange_order_id.clone());

        tracing::debug!(
            "Paper venue accepted {} {:?} {} x{}",
            exchange_order_id,
            plan.side,
            plan.symbol,
            plan.quantity
        );

        Ok(OrderAck { exchange_order_id })
    }

    async fn order_status(
        &self,
        exchange_order_id: &str,
    ) -> Result<OrderStatusReport, ExchangeError> {
        let state = self.state.lock().unwrap();
        let order = state
            .orders
            .get(exchange_order_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(exchange_order_id.to_string()))?;

        Ok(OrderStatusReport {
            exchange_order_id: exchange_order_id.to_string(),
            status: order.status,
            fills: order.fills.clone(),
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.state
            .lock()
            .unwrap()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Transport(format!("no mark price for {symbol}")))
    }

    async fn reconnect(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<ExchangeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        self.state.lock().unwrap().event_tx = Some(tx);
        rx
    }
}
