// Exchange collaborator boundary
pub mod paper;
pub mod rest;

pub use paper::PaperExchange;
pub use rest::RestExchange;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{Fill, OrderPlan};

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level failure; the connection may be retried, the order was not accepted
    #[error("transport failure: {0}")]
    Transport(String),
    /// The venue refused the order; terminal, never retried
    #[error("order rejected by venue: {0}")]
    Rejected(String),
    #[error("unknown order {0}")]
    UnknownOrder(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}

/// Synchronous acknowledgment returned by order placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
}

/// Venue-side order status, as reported by a status query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VenueStatus {
    Open,
    Filled,
    Canceled,
    Rejected,
}

/// Point-in-time order report used during resynchronization
#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub exchange_order_id: String,
    pub status: VenueStatus,
    pub fills: Vec<Fill>,
}

/// Push events from the venue's order/fill stream
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    Fill {
        exchange_order_id: String,
        fill: Fill,
    },
    Canceled {
        exchange_order_id: String,
    },
    /// The feed dropped; the consumer must resynchronize before trusting
    /// local state again
    Disconnected,
}

/// The only operations the pipeline requires from an exchange.
///
/// `place_order` treats the plan id as a client order id: resubmitting the
/// same plan after a transport failure must not create a second venue order.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, plan: &OrderPlan) -> Result<OrderAck, ExchangeError>;

    async fn order_status(&self, exchange_order_id: &str)
        -> Result<OrderStatusReport, ExchangeError>;

    async fn mark_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Re-establish the connection after a transport failure
    async fn reconnect(&self) -> Result<(), ExchangeError>;

    /// Subscribe to the order/fill event stream
    fn subscribe(&self) -> mpsc::Receiver<ExchangeEvent>;
}
