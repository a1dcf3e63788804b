use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::{Fill, OrderRecord, OrderState, Position};
use crate::Result;

/// Tolerance for treating a cumulative fill as complete
const QTY_EPSILON: f64 = 1e-9;

/// Result of applying one exchange fill event
#[derive(Debug, Clone)]
pub enum FillOutcome {
    Applied {
        position: Position,
        record: OrderRecord,
    },
    /// The fill id was already recorded; replay ignored
    Duplicate,
    /// The order is already terminal; late event ignored
    TerminalOrder,
}

/// Per-symbol book: the position plus every order record for that symbol.
///
/// A book is only ever touched while holding its lock, which is what
/// serializes fills per symbol and makes the risk-check/submit critical
/// section atomic.
#[derive(Debug)]
pub struct SymbolBook {
    pub position: Position,
    orders: HashMap<Uuid, OrderRecord>,
}

impl SymbolBook {
    fn new(symbol: &str) -> Self {
        Self {
            position: Position::flat(symbol),
            orders: HashMap::new(),
        }
    }

    /// Count of non-terminal order records
    pub fn in_flight(&self) -> usize {
        self.orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .count()
    }

    pub fn register_order(&mut self, record: OrderRecord) {
        self.position.open_orders.insert(record.order_id);
        self.orders.insert(record.order_id, record);
    }

    pub fn record(&self, order_id: Uuid) -> Option<&OrderRecord> {
        self.orders.get(&order_id)
    }

    pub fn record_mut(&mut self, order_id: Uuid) -> Option<&mut OrderRecord> {
        self.orders.get_mut(&order_id)
    }

    /// Drop a terminal order from the open set
    pub fn close_order(&mut self, order_id: Uuid) {
        self.position.open_orders.remove(&order_id);
    }

    pub fn open_records(&self) -> Vec<OrderRecord> {
        self.orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Apply a signed fill quantity (buys positive) at `price` to the
    /// position using weighted-average cost. Returns realized P&L, which is
    /// nonzero only when the fill reduces or reverses the position.
    fn apply_to_position(&mut self, signed_qty: f64, price: f64) -> f64 {
        let pos = &mut self.position;
        let net = pos.net_quantity;

        // Same direction (or flat): accumulate and re-average
        if net == 0.0 || net.signum() == signed_qty.signum() {
            let total = net.abs() + signed_qty.abs();
            pos.average_entry_price =
                (pos.average_entry_price * net.abs() + price * signed_qty.abs()) / total;
            pos.net_quantity = net + signed_qty;
            return 0.0;
        }

        let closing = signed_qty.abs().min(net.abs());
        let realized = if net > 0.0 {
            (price - pos.average_entry_price) * closing
        } else {
            (pos.average_entry_price - price) * closing
        };
        pos.realized_pnl += realized;
        pos.net_quantity = net + signed_qty;

        if pos.net_quantity == 0.0 {
            pos.average_entry_price = 0.0;
        } else if pos.net_quantity.signum() != net.signum() {
            // Reversal: the surplus opens a fresh position at the fill price
            pos.average_entry_price = price;
        }

        realized
    }
}

#[derive(Debug)]
struct DayStats {
    date: NaiveDate,
    realized_pnl: f64,
}

/// Serializable snapshot of the whole ledger, sufficient to resume after a
/// crash: every position and every order record still in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCheckpoint {
    pub positions: Vec<Position>,
    pub open_orders: Vec<OrderRecord>,
}

/// Durable-state owner for positions and order records.
///
/// Books are independent: fills for different symbols apply concurrently,
/// fills for one symbol serialize on its lock.
pub struct PositionLedger {
    books: RwLock<HashMap<String, Arc<Mutex<SymbolBook>>>>,
    /// order_id -> symbol, for event routing
    index: std::sync::Mutex<HashMap<Uuid, String>>,
    daily: std::sync::Mutex<DayStats>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            index: std::sync::Mutex::new(HashMap::new()),
            daily: std::sync::Mutex::new(DayStats {
                date: Utc::now().date_naive(),
                realized_pnl: 0.0,
            }),
        }
    }

    /// Rebuild the ledger from persisted state
    pub async fn restore(checkpoint: LedgerCheckpoint) -> Self {
        let ledger = Self::new();

        for position in checkpoint.positions {
            let book = ledger.book(&position.symbol).await;
            let mut book = book.lock().await;
            book.position = position;
        }

        let count = checkpoint.open_orders.len();
        for record in checkpoint.open_orders {
            ledger.index_order(record.order_id, &record.symbol);
            let book = ledger.book(&record.symbol).await;
            let mut book = book.lock().await;
            book.register_order(record);
        }

        tracing::info!("Restored ledger with {} in-flight orders", count);
        ledger
    }

    /// Book for a symbol, created on first touch
    pub async fn book(&self, symbol: &str) -> Arc<Mutex<SymbolBook>> {
        {
            let books = self.books.read().await;
            if let Some(book) = books.get(symbol) {
                return book.clone();
            }
        }

        let mut books = self.books.write().await;
        books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolBook::new(symbol))))
            .clone()
    }

    pub fn index_order(&self, order_id: Uuid, symbol: &str) {
        self.index
            .lock()
            .unwrap()
            .insert(order_id, symbol.to_string());
    }

    pub fn symbol_of(&self, order_id: Uuid) -> Option<String> {
        self.index.lock().unwrap().get(&order_id).cloned()
    }

    /// Consistent point-in-time view of one symbol
    pub async fn snapshot(&self, symbol: &str) -> Position {
        let book = self.book(symbol).await;
        let book = book.lock().await;
        book.position.clone()
    }

    /// Apply a fill to the order's symbol book in one locked step: dedupe by
    /// fill id, push it onto the record, advance the order state, and fold
    /// the quantity into the position. Replaying a fill is a no-op, which is
    /// what makes reconciliation idempotent.
    pub async fn apply_fill(&self, order_id: Uuid, fill: &Fill) -> Result<FillOutcome> {
        let symbol = self
            .symbol_of(order_id)
            .ok_or_else(|| format!("fill for unknown order {order_id}"))?;

        let book = self.book(&symbol).await;
        let mut book = book.lock().await;

        let record = book
            .record_mut(order_id)
            .ok_or_else(|| format!("order {order_id} missing from book {symbol}"))?;

        if record.state.is_terminal() {
            return Ok(FillOutcome::TerminalOrder);
        }
        if record.has_fill(&fill.fill_id) {
            tracing::debug!("Duplicate fill {} for order {}, ignored", fill.fill_id, order_id);
            return Ok(FillOutcome::Duplicate);
        }

        let signed = record.signed_quantity(fill);
        record.fills.push(fill.clone());
        record.last_update = Utc::now();
        record.state = if record.filled_quantity() >= record.quantity - QTY_EPSILON {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        let record_snapshot = record.clone();

        if record_snapshot.state.is_terminal() {
            book.close_order(order_id);
        }

        let realized = book.apply_to_position(signed, fill.price);
        if realized != 0.0 {
            self.note_realized(realized);
        }

        Ok(FillOutcome::Applied {
            position: book.position.clone(),
            record: record_snapshot,
        })
    }

    /// Move an order to a terminal state that carries no fill (cancel,
    /// rejection) and drop it from the open set
    pub async fn finalize_order(&self, order_id: Uuid, state: OrderState) -> Result<OrderRecord> {
        let symbol = self
            .symbol_of(order_id)
            .ok_or_else(|| format!("unknown order {order_id}"))?;

        let book = self.book(&symbol).await;
        let mut book = book.lock().await;

        let record = book
            .record_mut(order_id)
            .ok_or_else(|| format!("order {order_id} missing from book {symbol}"))?;

        if record.state.is_terminal() {
            return Ok(record.clone());
        }

        record.state = state;
        record.last_update = Utc::now();
        let snapshot = record.clone();
        if state.is_terminal() {
            book.close_order(order_id);
        }

        Ok(snapshot)
    }

    /// Gross notional across all symbols, valued at average entry
    pub async fn gross_notional(&self) -> f64 {
        let books = self.books.read().await;
        let mut total = 0.0;
        for book in books.values() {
            let book = book.lock().await;
            total += book.position.net_quantity.abs() * book.position.average_entry_price;
        }
        total
    }

    /// Realized P&L accumulated today (UTC); resets on date rollover
    pub fn daily_realized_pnl(&self) -> f64 {
        let mut daily = self.daily.lock().unwrap();
        let today = Utc::now().date_naive();
        if daily.date != today {
            daily.date = today;
            daily.realized_pnl = 0.0;
        }
        daily.realized_pnl
    }

    fn note_realized(&self, delta: f64) {
        let mut daily = self.daily.lock().unwrap();
        let today = Utc::now().date_naive();
        if daily.date != today {
            daily.date = today;
            daily.realized_pnl = 0.0;
        }
        daily.realized_pnl += delta;
    }

    /// Snapshot of everything needed to survive a restart
    pub async fn checkpoint(&self) -> LedgerCheckpoint {
        let books = self.books.read().await;
        let mut positions = Vec::new();
        let mut open_orders = Vec::new();

        for book in books.values() {
            let book = book.lock().await;
            positions.push(book.position.clone());
            open_orders.extend(book.open_records());
        }

        LedgerCheckpoint {
            positions,
            open_orders,
        }
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderPlan, OrderSide, OrderType};
    use chrono::Utc;

    fn fill(id: &str, price: f64, quantity: f64) -> Fill {
        Fill {
            fill_id: id.to_string(),
            price,
            quantity,
            timestamp: Utc::now(),
        }
    }

    fn plan(symbol: &str, side: OrderSide, quantity: f64) -> OrderPlan {
        OrderPlan {
            plan_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Market,
            price_limit: None,
            risk_tag: "test".to_string(),
        }
    }

    async fn register(ledger: &PositionLedger, plan: &OrderPlan) -> Uuid {
        let record = OrderRecord::new(plan);
        let order_id = record.order_id;
        ledger.index_order(order_id, &plan.symbol);
        let book = ledger.book(&plan.symbol).await;
        book.lock().await.register_order(record);
        order_id
    }

    fn applied(outcome: FillOutcome) -> Position {
        match outcome {
            FillOutcome::Applied { position, .. } => position,
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_net_quantity_tracks_fills() {
        let ledger = PositionLedger::new();
        let order_id = register(&ledger, &plan("BTC", OrderSide::Buy, 2.0)).await;

        ledger.apply_fill(order_id, &fill("f1", 50_000.0, 1.5)).await.unwrap();
        let position =
            applied(ledger.apply_fill(order_id, &fill("f2", 50_100.0, 0.5)).await.unwrap());

        assert_eq!(position.net_quantity, 2.0);
        // Weighted average: (50000*1.5 + 50100*0.5) / 2.0
        assert!((position.average_entry_price - 50_025.0).abs() < 1e-9);
        assert_eq!(position.realized_pnl, 0.0);
    }

    #[tokio::test]
    async fn test_fill_advances_order_state() {
        let ledger = PositionLedger::new();
        let order_id = register(&ledger, &plan("BTC", OrderSide::Buy, 2.0)).await;

        let outcome = ledger.apply_fill(order_id, &fill("f1", 50_000.0, 0.5)).await.unwrap();
        match outcome {
            FillOutcome::Applied { record, .. } => {
                assert_eq!(record.state, OrderState::PartiallyFilled)
            }
            other => panic!("unexpected {other:?}"),
        }

        let outcome = ledger.apply_fill(order_id, &fill("f2", 50_000.0, 1.5)).await.unwrap();
        match outcome {
            FillOutcome::Applied { record, position } => {
                assert_eq!(record.state, OrderState::Filled);
                assert!(position.open_orders.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_fill_is_idempotent() {
        let ledger = PositionLedger::new();
        let order_id = register(&ledger, &plan("BTC", OrderSide::Buy, 2.0)).await;

        let first = fill("f1", 50_000.0, 1.0);
        applied(ledger.apply_fill(order_id, &first).await.unwrap());

        // Replaying the same exchange event must not double-count
        let outcome = ledger.apply_fill(order_id, &first).await.unwrap();
        assert!(matches!(outcome, FillOutcome::Duplicate));

        let position = ledger.snapshot("BTC").await;
        assert_eq!(position.net_quantity, 1.0);
    }

    #[tokio::test]
    async fn test_realized_pnl_on_reducing_fill() {
        let ledger = PositionLedger::new();
        let buy = register(&ledger, &plan("SOL", OrderSide::Buy, 10.0)).await;
        ledger.apply_fill(buy, &fill("f1", 100.0, 10.0)).await.unwrap();

        let sell = register(&ledger, &plan("SOL", OrderSide::Sell, 4.0)).await;
        let position = applied(ledger.apply_fill(sell, &fill("f2", 110.0, 4.0)).await.unwrap());

        assert_eq!(position.net_quantity, 6.0);
        assert_eq!(position.average_entry_price, 100.0);
        assert!((position.realized_pnl - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_full_close_resets_average_entry() {
        let ledger = PositionLedger::new();
        let buy = register(&ledger, &plan("SOL", OrderSide::Buy, 3.0)).await;
        ledger.apply_fill(buy, &fill("f1", 100.0, 3.0)).await.unwrap();

        let sell = register(&ledger, &plan("SOL", OrderSide::Sell, 3.0)).await;
        let position = applied(ledger.apply_fill(sell, &fill("f2", 95.0, 3.0)).await.unwrap());

        assert_eq!(position.net_quantity, 0.0);
        assert_eq!(position.average_entry_price, 0.0);
        assert!((position.realized_pnl + 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reversal_opens_at_fill_price() {
        let ledger = PositionLedger::new();
        let buy = register(&ledger, &plan("ETH", OrderSide::Buy, 2.0)).await;
        ledger.apply_fill(buy, &fill("f1", 2000.0, 2.0)).await.unwrap();

        // Sell 5: closes the 2 long (realizing), leaves a 3 short at 2100
        let sell = register(&ledger, &plan("ETH", OrderSide::Sell, 5.0)).await;
        let position = applied(ledger.apply_fill(sell, &fill("f2", 2100.0, 5.0)).await.unwrap());

        assert_eq!(position.net_quantity, -3.0);
        assert_eq!(position.average_entry_price, 2100.0);
        assert!((position.realized_pnl - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_short_position_pnl() {
        let ledger = PositionLedger::new();
        let sell = register(&ledger, &plan("ETH", OrderSide::Sell, 2.0)).await;
        ledger.apply_fill(sell, &fill("f1", 2000.0, 2.0)).await.unwrap();

        let buy = register(&ledger, &plan("ETH", OrderSide::Buy, 2.0)).await;
        let position = applied(ledger.apply_fill(buy, &fill("f2", 1900.0, 2.0)).await.unwrap());

        assert_eq!(position.net_quantity, 0.0);
        assert!((position.realized_pnl - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_finalize_order_is_sticky() {
        let ledger = PositionLedger::new();
        let order_id = register(&ledger, &plan("BTC", OrderSide::Buy, 1.0)).await;

        let record = ledger.finalize_order(order_id, OrderState::Canceled).await.unwrap();
        assert_eq!(record.state, OrderState::Canceled);

        // Terminal states are immutable; a late event cannot resurrect
        let record = ledger.finalize_order(order_id, OrderState::Filled).await.unwrap();
        assert_eq!(record.state, OrderState::Canceled);

        let outcome = ledger
            .apply_fill(order_id, &fill("late", 50_000.0, 1.0))
            .await
            .unwrap();
        assert!(matches!(outcome, FillOutcome::TerminalOrder));
    }

    #[tokio::test]
    async fn test_in_flight_count() {
        let ledger = PositionLedger::new();
        let order_id = register(&ledger, &plan("BTC", OrderSide::Buy, 1.0)).await;

        let book = ledger.book("BTC").await;
        assert_eq!(book.lock().await.in_flight(), 1);

        {
            let mut book = book.lock().await;
            book.record_mut(order_id).unwrap().state = OrderState::Filled;
            book.close_order(order_id);
        }
        assert_eq!(book.lock().await.in_flight(), 0);
        assert!(book.lock().await.position.open_orders.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let ledger = PositionLedger::new();
        let buy = register(&ledger, &plan("BTC", OrderSide::Buy, 1.0)).await;
        ledger.apply_fill(buy, &fill("f1", 50_000.0, 0.4)).await.unwrap();

        let checkpoint = ledger.checkpoint().await;
        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: LedgerCheckpoint = serde_json::from_str(&json).unwrap();
        let revived = PositionLedger::restore(restored).await;

        let position = revived.snapshot("BTC").await;
        assert_eq!(position.net_quantity, 0.4);
        assert_eq!(position.average_entry_price, 50_000.0);

        let book = revived.book("BTC").await;
        let book = book.lock().await;
        assert_eq!(book.in_flight(), 1);
        assert_eq!(book.record(buy).unwrap().filled_quantity(), 0.4);
    }

    #[tokio::test]
    async fn test_daily_pnl_accumulates() {
        let ledger = PositionLedger::new();
        let buy = register(&ledger, &plan("SOL", OrderSide::Buy, 2.0)).await;
        ledger.apply_fill(buy, &fill("f1", 100.0, 2.0)).await.unwrap();

        assert_eq!(ledger.daily_realized_pnl(), 0.0);

        let sell = register(&ledger, &plan("SOL", OrderSide::Sell, 2.0)).await;
        ledger.apply_fill(sell, &fill("f2", 90.0, 2.0)).await.unwrap();

        assert!((ledger.daily_realized_pnl() + 20.0).abs() < 1e-9);
    }
}
