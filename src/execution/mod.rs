use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock as GateLock;
use uuid::Uuid;

use crate::db::StateStore;
use crate::exchange::{ExchangeClient, ExchangeError, ExchangeEvent, VenueStatus};
use crate::ledger::{FillOutcome, PositionLedger, SymbolBook};
use crate::models::{OrderPlan, OrderRecord, OrderState, OrderType};
use crate::Result;

const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BASE_MS: u64 = 500;

/// What one reconciliation step did, so the caller can notify and publish
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// A fill was applied; the record snapshot reflects the new state
    Updated(OrderRecord),
    /// The order reached a terminal state
    Terminal(OrderRecord),
    /// Replayed or late event, nothing changed
    Ignored,
}

/// Submits approved plans and keeps local order state aligned with the
/// venue.
///
/// Submission and resynchronization are mutually exclusive through an
/// internal gate: after a feed disconnect no new order leaves until every
/// non-terminal record has been reconciled against venue-reported status.
pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeClient>,
    ledger: Arc<PositionLedger>,
    store: Arc<dyn StateStore>,
    /// exchange order id -> local order id
    routes: std::sync::Mutex<HashMap<String, Uuid>>,
    /// Read side held for submissions, write side for resync
    gate: GateLock<()>,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        ledger: Arc<PositionLedger>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            exchange,
            ledger,
            store,
            routes: std::sync::Mutex::new(HashMap::new()),
            gate: GateLock::new(()),
        }
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    /// Block until submissions are allowed (i.e. no resync in progress).
    /// Callers take this permit BEFORE locking the symbol book, so the lock
    /// order against `resync` is consistent.
    pub async fn submit_permit(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Submit an approved plan while the caller holds the symbol book lock.
    ///
    /// The record is registered (and persisted) as Pending before the wire
    /// call so a crash mid-submission is recoverable. A transport failure
    /// retries the connection, then resubmits the same plan id; the venue
    /// dedupes on it, so no duplicate order can result. A venue rejection is
    /// terminal and is not retried.
    pub async fn submit(&self, plan: &OrderPlan, book: &mut SymbolBook) -> Result<OrderRecord> {
        let record = OrderRecord::new(plan);
        let order_id = record.order_id;

        self.ledger.index_order(order_id, &plan.symbol);
        book.register_order(record.clone());
        if let Err(e) = self.store.save_order(&record).await {
            tracing::warn!("Failed to persist pending order {}: {}", order_id, e);
        }

        match self.place_with_reconnect(plan).await {
            Ok(ack) => {
                self.routes
                    .lock()
                    .unwrap()
                    .insert(ack.exchange_order_id.clone(), order_id);

                let record = book
                    .record_mut(order_id)
                    .ok_or("submitted order vanished from book")?;
                record.exchange_order_id = Some(ack.exchange_order_id);
                record.state = OrderState::Acknowledged;
                record.last_update = chrono::Utc::now();
                let snapshot = record.clone();

                if let Err(e) = self.store.save_order(&snapshot).await {
                    tracing::warn!("Failed to persist ack for {}: {}", order_id, e);
                }

                tracing::info!(
                    "Order {} acknowledged as {} ({} {:?} x{})",
                    order_id,
                    snapshot.exchange_order_id.as_deref().unwrap_or("?"),
                    plan.symbol,
                    plan.side,
                    plan.quantity
                );
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!("Submission of plan {} failed: {}", plan.plan_id, e);

                let record = book
                    .record_mut(order_id)
                    .ok_or("submitted order vanished from book")?;
                record.state = OrderState::Rejected;
                record.last_update = chrono::Utc::now();
                let snapshot = record.clone();
                book.close_order(order_id);

                if let Err(e) = self.store.save_order(&snapshot).await {
                    tracing::warn!("Failed to persist rejection for {}: {}", order_id, e);
                }
                Ok(snapshot)
            }
        }
    }

    /// Place an order, retrying the connection (not the order) on transport
    /// failures. Every attempt carries the same plan id.
    async fn place_with_reconnect(
        &self,
        plan: &OrderPlan,
    ) -> std::result::Result<crate::exchange::OrderAck, ExchangeError> {
        let mut attempt = 0;
        loop {
            match self.exchange.place_order(plan).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() && attempt < RECONNECT_ATTEMPTS => {
                    attempt += 1;
                    let delay = Duration::from_millis(RECONNECT_BASE_MS * 2u64.pow(attempt - 1));
                    tracing::warn!(
                        "Transport failure placing plan {} ({}), reconnecting in {:?} (attempt {}/{})",
                        plan.plan_id,
                        e,
                        delay,
                        attempt,
                        RECONNECT_ATTEMPTS
                    );
                    tokio::time::sleep(delay).await;
                    self.exchange.reconnect().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply one venue event to local state. Idempotent: replayed fills and
    /// events for terminal orders are ignored.
    pub async fn reconcile(&self, event: &ExchangeEvent) -> Result<ReconcileOutcome> {
        match event {
            ExchangeEvent::Fill {
                exchange_order_id,
                fill,
            } => {
                let Some(order_id) = self.route(exchange_order_id) else {
                    tracing::warn!(
                        "Fill {} for unknown exchange order {}, ignored",
                        fill.fill_id,
                        exchange_order_id
                    );
                    return Ok(ReconcileOutcome::Ignored);
                };

                match self.ledger.apply_fill(order_id, fill).await? {
                    FillOutcome::Applied { position, record } => {
                        if let Err(e) = self.store.save_order(&record).await {
                            tracing::warn!("Failed to persist order {}: {}", order_id, e);
                        }
                        if let Err(e) = self.store.save_position(&position).await {
                            tracing::warn!("Failed to persist position {}: {}", position.symbol, e);
                        }

                        if record.state.is_terminal() {
                            Ok(ReconcileOutcome::Terminal(record))
                        } else {
                            Ok(ReconcileOutcome::Updated(record))
                        }
                    }
                    FillOutcome::Duplicate | FillOutcome::TerminalOrder => {
                        Ok(ReconcileOutcome::Ignored)
                    }
                }
            }
            ExchangeEvent::Canceled { exchange_order_id } => {
                let Some(order_id) = self.route(exchange_order_id) else {
                    return Ok(ReconcileOutcome::Ignored);
                };

                let record = self
                    .ledger
                    .finalize_order(order_id, OrderState::Canceled)
                    .await?;
                if let Err(e) = self.store.save_order(&record).await {
                    tracing::warn!("Failed to persist cancel for {}: {}", order_id, e);
                }
                Ok(ReconcileOutcome::Terminal(record))
            }
            ExchangeEvent::Disconnected => {
                // Handled by the owning stage via resync()
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    /// After a feed drop: reconnect, then query venue-side status for every
    /// non-terminal record and replay what was missed through the normal
    /// idempotent fill path. Submissions are blocked until this completes.
    /// Returns the records that reached a terminal state during resync.
    pub async fn resync(&self) -> Result<Vec<OrderRecord>> {
        let _exclusive = self.gate.write().await;
        tracing::info!("Resynchronizing with venue after feed drop");

        self.exchange
            .reconnect()
            .await
            .map_err(|e| format!("reconnect failed: {e}"))?;

        let open = self.ledger.checkpoint().await.open_orders;
        let mut terminal = Vec::new();

        for record in open {
            match &record.exchange_order_id {
                Some(exchange_order_id) => {
                    let report = self.exchange.order_status(exchange_order_id).await?;

                    for fill in &report.fills {
                        if let FillOutcome::Applied { position, record } =
                            self.ledger.apply_fill(record.order_id, fill).await?
                        {
                            let _ = self.store.save_order(&record).await;
                            let _ = self.store.save_position(&position).await;
                            if record.state.is_terminal() {
                                terminal.push(record);
                            }
                        }
                    }

                    // Cancels and rejections carry no fill event to replay
                    let end_state = match report.status {
                        VenueStatus::Canceled => Some(OrderState::Canceled),
                        VenueStatus::Rejected => Some(OrderState::Rejected),
                        VenueStatus::Open | VenueStatus::Filled => None,
                    };
                    if let Some(state) = end_state {
                        let record = self.ledger.finalize_order(record.order_id, state).await?;
                        let _ = self.store.save_order(&record).await;
                        terminal.push(record);
                    }
                }
                None => {
                    // Crashed between registration and the wire call: the
                    // plan id makes re-placement idempotent
                    let plan = OrderPlan {
                        plan_id: record.plan_id,
                        symbol: record.symbol.clone(),
                        side: record.side,
                        quantity: record.quantity,
                        order_type: OrderType::Market,
                        price_limit: None,
                        risk_tag: "resync".to_string(),
                    };
                    match self.exchange.place_order(&plan).await {
                        Ok(ack) => {
                            self.routes
                                .lock()
                                .unwrap()
                                .insert(ack.exchange_order_id.clone(), record.order_id);
                            let book = self.ledger.book(&record.symbol).await;
                            let mut book = book.lock().await;
                            if let Some(rec) = book.record_mut(record.order_id) {
                                rec.exchange_order_id = Some(ack.exchange_order_id);
                                rec.state = OrderState::Acknowledged;
                                rec.last_update = chrono::Utc::now();
                                let _ = self.store.save_order(rec).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Re-placement of {} failed during resync: {}",
                                record.order_id,
                                e
                            );
                            let record = self
                                .ledger
                                .finalize_order(record.order_id, OrderState::Rejected)
                                .await?;
                            let _ = self.store.save_order(&record).await;
                            terminal.push(record);
                        }
                    }
                }
            }
        }

        tracing::info!("Resync complete, {} orders reached terminal states", terminal.len());
        Ok(terminal)
    }

    /// Rebuild the exchange-id routing table from restored records
    pub fn restore_routes(&self, records: &[OrderRecord]) {
        let mut routes = self.routes.lock().unwrap();
        for record in records {
            if let Some(exchange_order_id) = &record.exchange_order_id {
                routes.insert(exchange_order_id.clone(), record.order_id);
            }
        }
    }

    fn route(&self, exchange_order_id: &str) -> Option<Uuid> {
        self.routes.lock().unwrap().get(exchange_order_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::exchange::PaperExchange;
    use crate::models::OrderSide;

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

    fn engine_with_venue() -> (ExecutionEngine, Arc<PaperExchange>) {
        let venue = Arc::new(PaperExchange::new());
        venue.set_price("BTC", 50_000.0);
        venue.set_price("SOL", 100.0);
        let engine = ExecutionEngine::new(
            venue.clone(),
            Arc::new(PositionLedger::new()),
            Arc::new(MemoryStore::new()),
        );
        (engine, venue)
    }

    async fn submit(engine: &ExecutionEngine, plan: &OrderPlan) -> OrderRecord {
        let book = engine.ledger().book(&plan.symbol).await;
        let mut book = book.lock().await;
        engine.submit(plan, &mut book).await.unwrap()
    }

    #[tokio::test]
    async fn test_submit_acknowledged() {
        let (engine, _venue) = engine_with_venue();
        let record = submit(&engine, &plan("BTC", OrderSide::Buy, 1.0)).await;

        assert_eq!(record.state, OrderState::Acknowledged);
        assert!(record.exchange_order_id.is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_retries_connection_once_order() {
        let (engine, venue) = engine_with_venue();
        venue.fail_next_placements(1);

        let record = submit(&engine, &plan("BTC", OrderSide::Buy, 1.0)).await;

        // Second attempt succeeded and exactly one venue order exists
        assert_eq!(record.state, OrderState::Acknowledged);
        assert_eq!(venue.order_count(), 1);
    }

    #[tokio::test]
    async fn test_venue_rejection_is_terminal() {
        let (engine, _venue) = engine_with_venue();

        // Unknown symbol: the paper venue rejects it outright
        let record = submit(&engine, &plan("DOGE", OrderSide::Buy, 1.0)).await;

        assert_eq!(record.state, OrderState::Rejected);
        let book = engine.ledger().book("DOGE").await;
        assert_eq!(book.lock().await.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_fill_updates_position() {
        let (engine, venue) = engine_with_venue();
        let record = submit(&engine, &plan("SOL", OrderSide::Buy, 2.0)).await;
        let exchange_id = record.exchange_order_id.clone().unwrap();

        let mut events = venue.subscribe();
        venue.push_fill(&exchange_id, 100.0, 2.0).await;
        let event = events.recv().await.unwrap();

        let outcome = engine.reconcile(&event).await.unwrap();
        match outcome {
            ReconcileOutcome::Terminal(rec) => assert_eq!(rec.state, OrderState::Filled),
            other => panic!("unexpected {other:?}"),
        }

        let position = engine.ledger().snapshot("SOL").await;
        assert_eq!(position.net_quantity, 2.0);
    }

    #[tokio::test]
    async fn test_reconcile_replay_is_ignored() {
        let (engine, venue) = engine_with_venue();
        let record = submit(&engine, &plan("SOL", OrderSide::Buy, 2.0)).await;
        let exchange_id = record.exchange_order_id.clone().unwrap();

        let mut events = venue.subscribe();
        venue.push_fill(&exchange_id, 100.0, 1.0).await;
        let event = events.recv().await.unwrap();

        engine.reconcile(&event).await.unwrap();
        let outcome = engine.reconcile(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Ignored));

        let position = engine.ledger().snapshot("SOL").await;
        assert_eq!(position.net_quantity, 1.0);
    }

    #[tokio::test]
    async fn test_resync_recovers_missed_fills() {
        let (engine, venue) = engine_with_venue();
        let record = submit(&engine, &plan("SOL", OrderSide::Buy, 2.0)).await;
        let exchange_id = record.exchange_order_id.clone().unwrap();

        // Partial fill seen live, the rest while the feed was down
        let mut events = venue.subscribe();
        venue.push_fill(&exchange_id, 100.0, 0.5).await;
        let event = events.recv().await.unwrap();
        engine.reconcile(&event).await.unwrap();

        venue.record_silent_fill(&exchange_id, 101.0, 1.5);

        let terminal = engine.resync().await.unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].state, OrderState::Filled);

        // No double counting of the fill that was already applied
        let position = engine.ledger().snapshot("SOL").await;
        assert_eq!(position.net_quantity, 2.0);
    }

    #[tokio::test]
    async fn test_unroutable_fill_ignored() {
        let (engine, _venue) = engine_with_venue();

        let event = ExchangeEvent::Fill {
            exchange_order_id: "ghost".to_string(),
            fill: crate::models::Fill {
                fill_id: "f-x".to_string(),
                price: 1.0,
                quantity: 1.0,
                timestamp: chrono::Utc::now(),
            },
        };

        let outcome = engine.reconcile(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Ignored));
    }
}
