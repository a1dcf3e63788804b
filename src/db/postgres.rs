use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::HashSet;
use uuid::Uuid;

use crate::db::StateStore;
use crate::models::{Fill, OrderRecord, OrderSide, OrderState, Position};
use crate::Result;

/// Postgres persistence for order records and positions
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    fn side_str(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }

    fn side_from(s: &str) -> Result<OrderSide> {
        match s {
            "Buy" => Ok(OrderSide::Buy),
            "Sell" => Ok(OrderSide::Sell),
            _ => Err("Invalid order side".into()),
        }
    }

    fn state_str(state: OrderState) -> &'static str {
        match state {
            OrderState::Pending => "Pending",
            OrderState::Acknowledged => "Acknowledged",
            OrderState::PartiallyFilled => "PartiallyFilled",
            OrderState::Filled => "Filled",
            OrderState::Canceled => "Canceled",
            OrderState::Rejected => "Rejected",
        }
    }

    fn state_from(s: &str) -> Result<OrderState> {
        match s {
            "Pending" => Ok(OrderState::Pending),
            "Acknowledged" => Ok(OrderState::Acknowledged),
            "PartiallyFilled" => Ok(OrderState::PartiallyFilled),
            "Filled" => Ok(OrderState::Filled),
            "Canceled" => Ok(OrderState::Canceled),
            "Rejected" => Ok(OrderState::Rejected),
            _ => Err("Invalid order state".into()),
        }
    }

    fn decode_order(row: &sqlx::postgres::PgRow) -> Result<OrderRecord> {
        let order_id: Uuid = row.get("order_id");
        let plan_id: Uuid = row.get("plan_id");
        let symbol: String = row.get("symbol");
        let side: String = row.get("side");
        let quantity: rust_decimal::Decimal = row.get("quantity");
        let exchange_order_id: Option<String> = row.get("exchange_order_id");
        let state: String = row.get("state");
        let submitted_at: DateTime<Utc> = row.get("submitted_at");
        let last_update: DateTime<Utc> = row.get("last_update");
        let fills_json: String = row.get("fills");

        let fills: Vec<Fill> = serde_json::from_str(&fills_json)?;

        Ok(OrderRecord {
            order_id,
            plan_id,
            symbol,
            side: Self::side_from(&side)?,
            quantity: quantity.to_string().parse()?,
            exchange_order_id,
            state: Self::state_from(&state)?,
            submitted_at,
            last_update,
            fills,
        })
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    /// Upsert an order record; state, exchange id and fill list advance
    /// while identity columns stay fixed
    async fn save_order(&self, record: &OrderRecord) -> Result<()> {
        let fills_json = serde_json::to_string(&record.fills)?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, plan_id, symbol, side, quantity,
                exchange_order_id, state, submitted_at, last_update, fills
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (order_id) DO UPDATE SET
                exchange_order_id = EXCLUDED.exchange_order_id,
                state = EXCLUDED.state,
                last_update = EXCLUDED.last_update,
                fills = EXCLUDED.fills,
                updated_at = NOW()
            "#,
        )
        .bind(record.order_id)
        .bind(record.plan_id)
        .bind(&record.symbol)
        .bind(Self::side_str(record.side))
        .bind(record.quantity)
        .bind(&record.exchange_order_id)
        .bind(Self::state_str(record.state))
        .bind(record.submitted_at)
        .bind(record.last_update)
        .bind(fills_json)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved order {} ({})", record.order_id, record.symbol);

        Ok(())
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        let open_orders_json =
            serde_json::to_string(&position.open_orders.iter().collect::<Vec<_>>())?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                symbol, net_quantity, average_entry_price, realized_pnl, open_orders
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (symbol) DO UPDATE SET
                net_quantity = EXCLUDED.net_quantity,
                average_entry_price = EXCLUDED.average_entry_price,
                realized_pnl = EXCLUDED.realized_pnl,
                open_orders = EXCLUDED.open_orders,
                updated_at = NOW()
            "#,
        )
        .bind(&position.symbol)
        .bind(position.net_quantity)
        .bind(position.average_entry_price)
        .bind(position.realized_pnl)
        .bind(open_orders_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_open_orders(&self) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, plan_id, symbol, side, quantity,
                   exchange_order_id, state, submitted_at, last_update, fills
            FROM orders
            WHERE state NOT IN ('Filled', 'Canceled', 'Rejected')
            ORDER BY submitted_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut orders = Vec::new();
        for row in rows {
            orders.push(Self::decode_order(&row)?);
        }

        tracing::info!("Loaded {} non-terminal orders from Postgres", orders.len());

        Ok(orders)
    }

    async fn load_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, net_quantity, average_entry_price, realized_pnl, open_orders
            FROM positions
            ORDER BY symbol ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::new();
        for row in rows {
            let symbol: String = row.get("symbol");
            let net_quantity: rust_decimal::Decimal = row.get("net_quantity");
            let average_entry_price: rust_decimal::Decimal = row.get("average_entry_price");
            let realized_pnl: rust_decimal::Decimal = row.get("realized_pnl");
            let open_orders_json: String = row.get("open_orders");

            let open_orders: HashSet<Uuid> = serde_json::from_str(&open_orders_json)?;

            positions.push(Position {
                symbol,
                net_quantity: net_quantity.to_string().parse()?,
                average_entry_price: average_entry_price.to_string().parse()?,
                realized_pnl: realized_pnl.to_string().parse()?,
                open_orders,
            });
        }

        tracing::info!("Loaded {} positions from Postgres", positions.len());

        Ok(positions)
    }
}
