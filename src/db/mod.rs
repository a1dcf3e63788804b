// Durable state for crash recovery
pub mod postgres;

pub use postgres::PostgresStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{OrderRecord, Position};
use crate::Result;

/// Minimal durable log of order records and positions: enough to replay all
/// non-terminal orders on startup without re-deriving from exchange history.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_order(&self, record: &OrderRecord) -> Result<()>;

    async fn save_position(&self, position: &Position) -> Result<()>;

    /// Every order record not yet in a terminal state
    async fn load_open_orders(&self) -> Result<Vec<OrderRecord>>;

    async fn load_positions(&self) -> Result<Vec<Position>>;
}

/// Process-local store used in tests and when no database is configured;
/// the bot then runs without crash recovery rather than refusing to start.
pub struct MemoryStore {
    orders: Mutex<HashMap<Uuid, OrderRecord>>,
    positions: Mutex<HashMap<String, Position>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_order(&self, record: &OrderRecord) -> Result<()> {
        self.orders
            .lock()
            .unwrap()
            .insert(record.order_id, record.clone());
        Ok(())
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        self.positions
            .lock()
            .unwrap()
            .insert(position.symbol.clone(), position.clone());
        Ok(())
    }

    async fn load_open_orders(&self) -> Result<Vec<OrderRecord>> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn load_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.lock().unwrap().values().cloned().collect())
    }
}
