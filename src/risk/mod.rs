use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::ledger::SymbolBook;
use crate::models::{Direction, OrderPlan, OrderSide, OrderType, TradeIntent};

// Type alias for the rate limiter to simplify signatures
type PlanRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Why an intent was denied. Enumerated so callers can branch on the
/// outcome; the order of the checks decides which reason wins when several
/// would apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DenyReason {
    #[error("an automated order for this symbol is already in flight")]
    DuplicateInFlight,
    #[error("symbol position cap reached")]
    CapExceeded,
    #[error("aggregate notional exposure cap reached")]
    ExposureExceeded,
    #[error("plan rate limit reached")]
    RateLimited,
    #[error("confidence below plan threshold")]
    LowConfidence,
    #[error("sized quantity rounds to zero")]
    SizeTooSmall,
    #[error("trading halted by daily-loss kill switch")]
    Halted,
}

/// Gatekeeper between extracted intents and the execution engine.
///
/// `evaluate` must be called while holding the symbol book lock, and the
/// approved plan must be submitted before releasing it; that is the critical
/// section that keeps two same-symbol intents from both passing the
/// in-flight check.
pub struct RiskGovernor {
    limits: RiskConfig,
    rate_limiter: Arc<PlanRateLimiter>,
}

impl RiskGovernor {
    pub fn new(limits: RiskConfig) -> Self {
        let plans = NonZeroU32::new(limits.max_plans_per_window.max(1)).unwrap();
        let window = Duration::from_secs(limits.rate_window_secs.max(1));
        let quota = Quota::with_period(window / plans.get())
            .unwrap()
            .allow_burst(plans);

        Self {
            limits,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Run the gate chain against a point-in-time book and produce a sized
    /// plan. First failing gate wins; gates run in a fixed order:
    /// in-flight cap, symbol cap, exposure cap, rate limit, confidence,
    /// then the kill switch, then sizing.
    pub fn evaluate(
        &self,
        intent: &TradeIntent,
        book: &SymbolBook,
        mark_price: f64,
        gross_notional: f64,
        daily_realized_pnl: f64,
    ) -> Result<OrderPlan, DenyReason> {
        let net = book.position.net_quantity;

        // Check 1: per-symbol in-flight cap
        if book.in_flight() >= self.limits.max_in_flight_per_symbol {
            return Err(DenyReason::DuplicateInFlight);
        }

        let opens_exposure = !matches!(intent.direction, Direction::Close);

        // Check 2: room under the per-symbol position cap
        let symbol_room = self.limits.max_symbol_quantity - net.abs();
        if opens_exposure && symbol_room <= 0.0 {
            return Err(DenyReason::CapExceeded);
        }

        // Check 3: room under the aggregate notional cap
        let exposure_room = self.limits.max_notional_exposure - gross_notional;
        if opens_exposure && exposure_room <= 0.0 {
            return Err(DenyReason::ExposureExceeded);
        }

        // Check 4: plans-per-window rate limit
        if self.rate_limiter.check().is_err() {
            return Err(DenyReason::RateLimited);
        }

        // Check 5: plan-time confidence floor
        if intent.confidence < self.limits.min_confidence {
            return Err(DenyReason::LowConfidence);
        }

        // Kill switch: realized losses today beyond the configured budget
        if daily_realized_pnl <= -self.limits.max_daily_loss {
            return Err(DenyReason::Halted);
        }

        let (side, quantity) = match intent.direction {
            Direction::Long => (
                OrderSide::Buy,
                self.sized_quantity(intent.suggested_size, symbol_room, exposure_room, mark_price),
            ),
            Direction::Short => (
                OrderSide::Sell,
                self.sized_quantity(intent.suggested_size, symbol_room, exposure_room, mark_price),
            ),
            Direction::Close => {
                let side = if net > 0.0 {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                };
                let wanted = if intent.suggested_size > 0.0 {
                    intent.suggested_size.min(net.abs())
                } else {
                    net.abs()
                };
                (side, self.round_to_lot(wanted))
            }
        };

        if quantity <= 0.0 {
            return Err(DenyReason::SizeTooSmall);
        }

        Ok(OrderPlan {
            plan_id: Uuid::new_v4(),
            symbol: intent.symbol.clone(),
            side,
            quantity,
            order_type: OrderType::Market,
            price_limit: None,
            risk_tag: format!("conf:{:.2}", intent.confidence),
        })
    }

    /// Risk-adjusted size: the smallest of the suggestion, the symbol cap
    /// room, and the exposure room at the mark price, floored to the lot step
    fn sized_quantity(
        &self,
        suggested: f64,
        symbol_room: f64,
        exposure_room: f64,
        mark_price: f64,
    ) -> f64 {
        let by_exposure = exposure_room / mark_price;
        self.round_to_lot(suggested.min(symbol_room).min(by_exposure))
    }

    fn round_to_lot(&self, quantity: f64) -> f64 {
        let lot = self.limits.lot_size;
        if lot <= 0.0 {
            return quantity.max(0.0);
        }
        // Relative epsilon so quantities sitting exactly on a lot boundary
        // survive floating-point division
        let steps = (quantity / lot * (1.0 + 1e-9)).floor();
        (steps * lot).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PositionLedger;
    use crate::models::{Fill, OrderRecord};
    use chrono::Utc;

    fn intent(symbol: &str, direction: Direction, confidence: f64, size: f64) -> TradeIntent {
        TradeIntent {
            intent_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            confidence,
            suggested_size: size,
            extracted_from: "msg-1".to_string(),
        }
    }

    fn limits() -> RiskConfig {
        RiskConfig {
            max_in_flight_per_symbol: 1,
            max_symbol_quantity: 1.0,
            max_notional_exposure: 100_000.0,
            max_plans_per_window: 100,
            rate_window_secs: 60,
            min_confidence: 0.5,
            lot_size: 0.0001,
            max_daily_loss: 5_000.0,
        }
    }

    async fn empty_book(ledger: &PositionLedger, symbol: &str) -> std::sync::Arc<tokio::sync::Mutex<SymbolBook>> {
        ledger.book(symbol).await
    }

    #[tokio::test]
    async fn test_full_size_plan_with_zero_exposure() {
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let book = book.lock().await;

        let plan = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 1.0),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap();

        assert_eq!(plan.side, OrderSide::Buy);
        assert!((plan.quantity - 1.0).abs() < 1e-9);
        assert_eq!(plan.order_type, OrderType::Market);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_denied() {
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let mut book = book.lock().await;

        // An unresolved automated order already exists
        let plan = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 1.0),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap();
        book.register_order(OrderRecord::new(&plan));

        let denied = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 1.0),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::DuplicateInFlight);
    }

    #[tokio::test]
    async fn test_first_failing_gate_wins() {
        // Both the in-flight cap and the confidence gate would fail; the
        // in-flight cap is checked first and must be the reported reason
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let mut book = book.lock().await;

        let plan = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 1.0),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap();
        book.register_order(OrderRecord::new(&plan));

        let denied = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.1, 1.0),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::DuplicateInFlight);
    }

    #[tokio::test]
    async fn test_cap_exceeded_when_no_room() {
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();

        // Existing position already at the symbol cap
        let record = OrderRecord::new(
            &governor
                .evaluate(
                    &intent("BTC", Direction::Long, 0.9, 1.0),
                    &*ledger.book("BTC").await.lock().await,
                    50_000.0,
                    0.0,
                    0.0,
                )
                .unwrap(),
        );
        let order_id = record.order_id;
        ledger.index_order(order_id, "BTC");
        ledger.book("BTC").await.lock().await.register_order(record);
        ledger
            .apply_fill(
                order_id,
                &Fill {
                    fill_id: "f1".to_string(),
                    price: 50_000.0,
                    quantity: 1.0,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
        {
            let book = ledger.book("BTC").await;
            let mut book = book.lock().await;
            book.record_mut(order_id).unwrap().state = crate::models::OrderState::Filled;
            book.close_order(order_id);
        }

        let book = ledger.book("BTC").await;
        let book = book.lock().await;
        let denied = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 0.5),
                &book,
                50_000.0,
                50_000.0,
                0.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::CapExceeded);
    }

    #[tokio::test]
    async fn test_exposure_exceeded() {
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "ETH").await;
        let book = book.lock().await;

        let denied = governor
            .evaluate(
                &intent("ETH", Direction::Long, 0.9, 1.0),
                &book,
                3_000.0,
                100_000.0,
                0.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::ExposureExceeded);
    }

    #[tokio::test]
    async fn test_exposure_room_bounds_quantity() {
        let mut cfg = limits();
        cfg.max_symbol_quantity = 10.0;
        let governor = RiskGovernor::new(cfg);
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let book = book.lock().await;

        // 25k of room at 50k per unit: at most 0.5 despite the 2.0 ask
        let plan = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 2.0),
                &book,
                50_000.0,
                75_000.0,
                0.0,
            )
            .unwrap();

        assert!((plan.quantity - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mut cfg = limits();
        cfg.max_plans_per_window = 1;
        cfg.rate_window_secs = 3600;
        let governor = RiskGovernor::new(cfg);
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let book = book.lock().await;

        governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 0.1),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap();

        let denied = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 0.1),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::RateLimited);
    }

    #[tokio::test]
    async fn test_low_confidence_at_plan_time() {
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let book = book.lock().await;

        let denied = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.3, 1.0),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::LowConfidence);
    }

    #[tokio::test]
    async fn test_size_too_small_after_rounding() {
        let mut cfg = limits();
        cfg.lot_size = 0.01;
        let governor = RiskGovernor::new(cfg);
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let book = book.lock().await;

        let denied = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 0.004),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::SizeTooSmall);
    }

    #[tokio::test]
    async fn test_kill_switch_halts_entries() {
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let book = book.lock().await;

        let denied = governor
            .evaluate(
                &intent("BTC", Direction::Long, 0.9, 1.0),
                &book,
                50_000.0,
                0.0,
                -6_000.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::Halted);
    }

    #[tokio::test]
    async fn test_close_with_no_position_denied() {
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();
        let book = empty_book(&ledger, "BTC").await;
        let book = book.lock().await;

        let denied = governor
            .evaluate(
                &intent("BTC", Direction::Close, 0.9, 0.0),
                &book,
                50_000.0,
                0.0,
                0.0,
            )
            .unwrap_err();

        assert_eq!(denied, DenyReason::SizeTooSmall);
    }

    #[tokio::test]
    async fn test_close_sells_long_position() {
        let governor = RiskGovernor::new(limits());
        let ledger = PositionLedger::new();

        let record = OrderRecord::new(
            &governor
                .evaluate(
                    &intent("SOL", Direction::Long, 0.9, 1.0),
                    &*ledger.book("SOL").await.lock().await,
                    100.0,
                    0.0,
                    0.0,
                )
                .unwrap(),
        );
        let order_id = record.order_id;
        ledger.index_order(order_id, "SOL");
        ledger.book("SOL").await.lock().await.register_order(record);
        ledger
            .apply_fill(
                order_id,
                &Fill {
                    fill_id: "f1".to_string(),
                    price: 100.0,
                    quantity: 1.0,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
        {
            let book = ledger.book("SOL").await;
            let mut book = book.lock().await;
            book.record_mut(order_id).unwrap().state = crate::models::OrderState::Filled;
            book.close_order(order_id);
        }

        let book = ledger.book("SOL").await;
        let book = book.lock().await;
        let plan = governor
            .evaluate(
                &intent("SOL", Direction::Close, 0.9, 0.0),
                &book,
                110.0,
                100.0,
                0.0,
            )
            .unwrap();

        assert_eq!(plan.side, OrderSide::Sell);
        assert!((plan.quantity - 1.0).abs() < 1e-9);
    }
}
