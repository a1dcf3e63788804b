use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// An unprocessed inbound chat message believed to contain trading intent.
///
/// Immutable once created; consumed exactly once by the extractor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSignal {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub raw_text: String,
    pub channel: String,
}

/// Trade direction as stated (or implied) by the message author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
    Close,
}

/// Structured interpretation of a RawSignal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub intent_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub confidence: f64,
    pub suggested_size: f64,
    /// source_id of the RawSignal this was extracted from
    pub extracted_from: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

/// A risk-approved, sized instruction ready for exchange submission.
/// Quantity is the risk-adjusted size, not the raw suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlan {
    pub plan_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price_limit: Option<f64>,
    pub risk_tag: String,
}

/// Order lifecycle states.
///
/// Pending -> Acknowledged -> PartiallyFilled -> Filled | Canceled | Rejected.
/// PartiallyFilled loops on additional fills; the last three are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected
        )
    }
}

/// A single execution reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    /// Exchange-assigned fill identifier, the dedupe key for replayed events
    pub fill_id: String,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
}

/// The tracked lifecycle of a submitted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: Uuid,
    pub plan_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub exchange_order_id: Option<String>,
    pub state: OrderState,
    pub submitted_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub fills: Vec<Fill>,
}

impl OrderRecord {
    pub fn new(plan: &OrderPlan) -> Self {
        let now = Utc::now();
        Self {
            order_id: Uuid::new_v4(),
            plan_id: plan.plan_id,
            symbol: plan.symbol.clone(),
            side: plan.side,
            quantity: plan.quantity,
            exchange_order_id: None,
            state: OrderState::Pending,
            submitted_at: now,
            last_update: now,
            fills: Vec::new(),
        }
    }

    /// Total quantity executed so far
    pub fn filled_quantity(&self) -> f64 {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    pub fn has_fill(&self, fill_id: &str) -> bool {
        self.fills.iter().any(|f| f.fill_id == fill_id)
    }

    /// Signed quantity of a fill against this order (buys positive)
    pub fn signed_quantity(&self, fill: &Fill) -> f64 {
        match self.side {
            OrderSide::Buy => fill.quantity,
            OrderSide::Sell => -fill.quantity,
        }
    }
}

/// The ledger's aggregate view of net holdings and P&L for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub net_quantity: f64,
    pub average_entry_price: f64,
    pub realized_pnl: f64,
    pub open_orders: HashSet<Uuid>,
}

impl Position {
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            net_quantity: 0.0,
            average_entry_price: 0.0,
            realized_pnl: 0.0,
            open_orders: HashSet::new(),
        }
    }
}
