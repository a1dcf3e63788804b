// Concurrency substrate: stage tasks, bounded queues, supervision
pub mod supervisor;

pub use supervisor::{HealthRegistry, RestartPolicy, StageState};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::AppConfig;
use crate::db::StateStore;
use crate::exchange::{ExchangeClient, ExchangeEvent};
use crate::execution::{ExecutionEngine, ReconcileOutcome};
use crate::extract::{Classifier, RejectReason, SignalExtractor};
use crate::ingest::SourceAdapter;
use crate::ledger::{LedgerCheckpoint, PositionLedger};
use crate::models::{OrderState, RawSignal, TradeIntent};
use crate::notify::{Notifier, PipelineEvent, PipelineSnapshot, StatePublisher};
use crate::risk::RiskGovernor;
use crate::Result;

const MARK_PRICE_ATTEMPTS: u32 = 3;
const TRANSIENT_RETRY_DELAY_MS: u64 = 250;

/// A raw signal that could not be turned into an intent
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub signal: RawSignal,
    pub reason: RejectReason,
    pub attempts: u32,
}

/// The assembled signal-to-execution pipeline.
///
/// Each stage runs as an independent supervised task; stages talk through
/// bounded queues, so a slow downstream stage backpressures its producer
/// instead of dropping work. Only the inbound chat buffer sheds load, by
/// dropping stale messages.
pub struct Pipeline {
    adapter: Arc<SourceAdapter>,
    ledger: Arc<PositionLedger>,
    engine: Arc<ExecutionEngine>,
    health: Arc<HealthRegistry>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    dead_letters: Mutex<mpsc::Receiver<DeadLetter>>,
}

impl Pipeline {
    /// Restore durable state, wire the stages, and start them under
    /// supervision
    pub async fn start(
        config: AppConfig,
        classifier: Arc<dyn Classifier>,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        publisher: Arc<dyn StatePublisher>,
    ) -> Result<Self> {
        // Replay durable state before anything moves
        let positions = store.load_positions().await?;
        let open_orders = store.load_open_orders().await?;
        let had_open_orders = !open_orders.is_empty();

        let ledger = Arc::new(
            PositionLedger::restore(LedgerCheckpoint {
                positions,
                open_orders: open_orders.clone(),
            })
            .await,
        );

        let engine = Arc::new(ExecutionEngine::new(
            exchange.clone(),
            ledger.clone(),
            store.clone(),
        ));
        engine.restore_routes(&open_orders);

        let adapter = Arc::new(SourceAdapter::new(
            config.pipeline.inbound_buffer,
            config.pipeline.max_signal_age_secs,
        ));
        let extractor = Arc::new(SignalExtractor::new(classifier, &config.extract));
        let governor = Arc::new(RiskGovernor::new(config.risk.clone()));
        let health = Arc::new(HealthRegistry::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (intent_tx, intent_rx) = mpsc::channel::<TradeIntent>(config.pipeline.queue_depth);
        let intent_rx = Arc::new(Mutex::new(intent_rx));
        let (dlq_tx, dlq_rx) = mpsc::channel::<DeadLetter>(config.pipeline.queue_depth);

        let policy = RestartPolicy {
            max_restarts: config.pipeline.max_stage_restarts,
            backoff_base: Duration::from_secs(config.pipeline.backoff_base_secs),
            backoff_cap: Duration::from_secs(config.pipeline.backoff_cap_secs),
        };

        let mut handles = Vec::new();

        // Extract stage: raw signals -> intents
        {
            let adapter = adapter.clone();
            let extractor = extractor.clone();
            let shutdown = shutdown_rx.clone();
            let max_retries = config.extract.max_retries;
            handles.push(supervisor::spawn_supervised(
                "extract",
                move || {
                    extract_stage(
                        adapter.clone(),
                        extractor.clone(),
                        intent_tx.clone(),
                        dlq_tx.clone(),
                        shutdown.clone(),
                        max_retries,
                    )
                },
                shutdown_rx.clone(),
                policy.clone(),
                health.clone(),
                notifier.clone(),
            ));
        }

        // Risk + submit stage: intents -> risk-checked venue orders
        {
            let engine = engine.clone();
            let governor = governor.clone();
            let exchange = exchange.clone();
            let ledger = ledger.clone();
            let notifier = notifier.clone();
            let publisher = publisher.clone();
            let health = health.clone();
            let shutdown = shutdown_rx.clone();
            let intent_rx = intent_rx.clone();
            let timeout = Duration::from_secs(config.exchange.timeout_secs);
            let sup_health = health.clone();
            let sup_notifier = notifier.clone();
            handles.push(supervisor::spawn_supervised(
                "risk",
                move || {
                    risk_stage(
                        intent_rx.clone(),
                        engine.clone(),
                        governor.clone(),
                        exchange.clone(),
                        ledger.clone(),
                        notifier.clone(),
                        publisher.clone(),
                        health.clone(),
                        shutdown.clone(),
                        timeout,
                    )
                },
                shutdown_rx.clone(),
                policy.clone(),
                sup_health,
                sup_notifier,
            ));
        }

        // Reconcile stage: venue events -> ledger updates, resync on drops
        {
            let engine = engine.clone();
            let exchange = exchange.clone();
            let ledger = ledger.clone();
            let notifier = notifier.clone();
            let publisher = publisher.clone();
            let health = health.clone();
            let shutdown = shutdown_rx.clone();
            let sup_health = health.clone();
            let sup_notifier = notifier.clone();
            handles.push(supervisor::spawn_supervised(
                "reconcile",
                move || {
                    reconcile_stage(
                        engine.clone(),
                        exchange.clone(),
                        ledger.clone(),
                        notifier.clone(),
                        publisher.clone(),
                        health.clone(),
                        shutdown.clone(),
                        had_open_orders,
                    )
                },
                shutdown_rx.clone(),
                policy,
                sup_health,
                sup_notifier,
            ));
        }

        tracing::info!("Pipeline started: extract, risk, reconcile stages supervised");

        Ok(Self {
            adapter,
            ledger,
            engine,
            health,
            shutdown_tx,
            handles,
            dead_letters: Mutex::new(dlq_rx),
        })
    }

    /// Sole inbound entry point: hand a raw chat signal to the pipeline
    pub fn ingest(&self, signal: RawSignal) {
        self.adapter.ingest(signal);
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub async fn next_dead_letter(&self) -> Option<DeadLetter> {
        self.dead_letters.lock().await.try_recv().ok()
    }

    /// Cooperative shutdown: every stage finishes its in-flight item and
    /// drains its queue before exiting
    pub async fn shutdown(self) {
        tracing::info!("Pipeline shutting down");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("Pipeline stopped");
    }
}

async fn extract_stage(
    adapter: Arc<SourceAdapter>,
    extractor: Arc<SignalExtractor>,
    intent_tx: mpsc::Sender<TradeIntent>,
    dlq_tx: mpsc::Sender<DeadLetter>,
    mut shutdown: watch::Receiver<bool>,
    max_retries: u32,
) -> Result<()> {
    loop {
        let signal = tokio::select! {
            signal = adapter.next() => signal,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Drain what is already buffered before exiting
                    while let Some(signal) = adapter.try_next() {
                        process_signal(&extractor, signal, &intent_tx, &dlq_tx, max_retries)
                            .await?;
                    }
                    return Ok(());
                }
                continue;
            }
        };

        process_signal(&extractor, signal, &intent_tx, &dlq_tx, max_retries).await?;
    }
}

async fn process_signal(
    extractor: &SignalExtractor,
    signal: RawSignal,
    intent_tx: &mpsc::Sender<TradeIntent>,
    dlq_tx: &mpsc::Sender<DeadLetter>,
    max_retries: u32,
) -> Result<()> {
    let mut attempts = 0;

    loop {
        attempts += 1;
        match extractor.extract(&signal).await {
            Ok(intent) => {
                tracing::info!(
                    "Extracted {:?} {} (confidence {:.2}) from {}",
                    intent.direction,
                    intent.symbol,
                    intent.confidence,
                    signal.source_id
                );
                // Blocking send: backpressure instead of dropping
                intent_tx
                    .send(intent)
                    .await
                    .map_err(|_| "intent queue closed")?;
                return Ok(());
            }
            Err(reason) if reason.is_transient() && attempts <= max_retries => {
                tracing::warn!(
                    "Transient extraction failure for {} (attempt {}/{}), requeueing",
                    signal.source_id,
                    attempts,
                    max_retries
                );
                tokio::time::sleep(Duration::from_millis(
                    TRANSIENT_RETRY_DELAY_MS * attempts as u64,
                ))
                .await;
            }
            Err(reason) => {
                if reason.is_transient() {
                    tracing::error!(
                        "Dropping signal {} after {} transient failures",
                        signal.source_id,
                        attempts
                    );
                } else {
                    tracing::debug!("Signal {} rejected: {}", signal.source_id, reason);
                }
                // Dead-letter for audit; shed if even that queue is full
                if dlq_tx
                    .try_send(DeadLetter {
                        signal,
                        reason,
                        attempts,
                    })
                    .is_err()
                {
                    tracing::warn!("Dead-letter queue full, audit record lost");
                }
                return Ok(());
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn risk_stage(
    intent_rx: Arc<Mutex<mpsc::Receiver<TradeIntent>>>,
    engine: Arc<ExecutionEngine>,
    governor: Arc<RiskGovernor>,
    exchange: Arc<dyn ExchangeClient>,
    ledger: Arc<PositionLedger>,
    notifier: Arc<dyn Notifier>,
    publisher: Arc<dyn StatePublisher>,
    health: Arc<HealthRegistry>,
    mut shutdown: watch::Receiver<bool>,
    call_timeout: Duration,
) -> Result<()> {
    let mut intent_rx = intent_rx.lock().await;

    loop {
        let intent = tokio::select! {
            received = intent_rx.recv() => match received {
                Some(intent) => intent,
                None => return Ok(()),
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Finish what is already queued, then exit
                    while let Ok(intent) = intent_rx.try_recv() {
                        handle_intent(
                            intent, &engine, &governor, &exchange, &ledger,
                            &notifier, &publisher, &health, call_timeout,
                        )
                        .await?;
                    }
                    return Ok(());
                }
                continue;
            }
        };

        handle_intent(
            intent, &engine, &governor, &exchange, &ledger, &notifier, &publisher, &health,
            call_timeout,
        )
        .await?;
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_intent(
    intent: TradeIntent,
    engine: &Arc<ExecutionEngine>,
    governor: &Arc<RiskGovernor>,
    exchange: &Arc<dyn ExchangeClient>,
    ledger: &Arc<PositionLedger>,
    notifier: &Arc<dyn Notifier>,
    publisher: &Arc<dyn StatePublisher>,
    health: &Arc<HealthRegistry>,
    call_timeout: Duration,
) -> Result<()> {
    let Some(mark_price) = fetch_mark_price(exchange, &intent.symbol, call_timeout).await else {
        tracing::error!(
            "No mark price for {} after {} attempts, intent {} dropped",
            intent.symbol,
            MARK_PRICE_ATTEMPTS,
            intent.intent_id
        );
        return Ok(());
    };

    // Aggregate figures are read before the symbol lock; the in-flight gate,
    // plan creation and submission then form one critical section under it
    let gross_notional = ledger.gross_notional().await;
    let daily_pnl = ledger.daily_realized_pnl();

    let _permit = engine.submit_permit().await;
    let book = ledger.book(&intent.symbol).await;
    let mut book = book.lock().await;

    match governor.evaluate(&intent, &book, mark_price, gross_notional, daily_pnl) {
        Ok(plan) => {
            tracing::info!(
                "Intent {} approved: {:?} {} x{} @ ~{}",
                intent.intent_id,
                plan.side,
                plan.symbol,
                plan.quantity,
                mark_price
            );

            // The approval is durably recorded (Pending order) before the
            // wire call inside submit; the symbol lock is released before
            // any notification goes out
            let record = engine.submit(&plan, &mut book).await?;
            drop(book);

            notifier
                .notify(&PipelineEvent::IntentApproved {
                    symbol: plan.symbol.clone(),
                    plan_id: plan.plan_id,
                    side: plan.side,
                    quantity: plan.quantity,
                })
                .await;

            if record.state == OrderState::Rejected {
                notifier
                    .notify(&PipelineEvent::OrderTerminal {
                        symbol: record.symbol.clone(),
                        order_id: record.order_id,
                        state: record.state,
                        filled_quantity: record.filled_quantity(),
                    })
                    .await;
            }
        }
        Err(reason) => {
            drop(book);
            tracing::info!("Intent {} denied: {}", intent.intent_id, reason);
            notifier
                .notify(&PipelineEvent::IntentDenied {
                    symbol: intent.symbol.clone(),
                    intent_id: intent.intent_id,
                    reason,
                })
                .await;
        }
    }

    publish_snapshot(ledger, health, publisher).await;
    Ok(())
}

async fn fetch_mark_price(
    exchange: &Arc<dyn ExchangeClient>,
    symbol: &str,
    call_timeout: Duration,
) -> Option<f64> {
    for attempt in 1..=MARK_PRICE_ATTEMPTS {
        match tokio::time::timeout(call_timeout, exchange.mark_price(symbol)).await {
            Ok(Ok(price)) => return Some(price),
            Ok(Err(e)) => {
                tracing::warn!(
                    "Mark price for {} failed (attempt {}/{}): {}",
                    symbol,
                    attempt,
                    MARK_PRICE_ATTEMPTS,
                    e
                );
            }
            Err(_) => {
                tracing::warn!(
                    "Mark price for {} timed out (attempt {}/{})",
                    symbol,
                    attempt,
                    MARK_PRICE_ATTEMPTS
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(
            TRANSIENT_RETRY_DELAY_MS * attempt as u64,
        ))
        .await;
    }
    None
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_stage(
    engine: Arc<ExecutionEngine>,
    exchange: Arc<dyn ExchangeClient>,
    ledger: Arc<PositionLedger>,
    notifier: Arc<dyn Notifier>,
    publisher: Arc<dyn StatePublisher>,
    health: Arc<HealthRegistry>,
    mut shutdown: watch::Receiver<bool>,
    resync_on_start: bool,
) -> Result<()> {
    // After a restart (ours or the stage's), local state may trail the
    // venue; reconcile before trusting the stream
    if resync_on_start || !ledger.checkpoint().await.open_orders.is_empty() {
        let terminal = engine.resync().await?;
        notify_terminal(&notifier, &terminal).await;
        publish_snapshot(&ledger, &health, &publisher).await;
    }

    let mut events = exchange.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            event = events.recv() => match event {
                Some(ExchangeEvent::Disconnected) | None => {
                    tracing::warn!("Venue feed dropped, resynchronizing");
                    let terminal = engine.resync().await?;
                    notify_terminal(&notifier, &terminal).await;
                    publish_snapshot(&ledger, &health, &publisher).await;
                    events = exchange.subscribe();
                }
                Some(event) => match engine.reconcile(&event).await? {
                    ReconcileOutcome::Terminal(record) => {
                        notify_terminal(&notifier, std::slice::from_ref(&record)).await;
                        publish_snapshot(&ledger, &health, &publisher).await;
                    }
                    ReconcileOutcome::Updated(_) => {
                        publish_snapshot(&ledger, &health, &publisher).await;
                    }
                    ReconcileOutcome::Ignored => {}
                },
            }
        }
    }
}

async fn notify_terminal(notifier: &Arc<dyn Notifier>, records: &[crate::models::OrderRecord]) {
    for record in records {
        notifier
            .notify(&PipelineEvent::OrderTerminal {
                symbol: record.symbol.clone(),
                order_id: record.order_id,
                state: record.state,
                filled_quantity: record.filled_quantity(),
            })
            .await;
    }
}

async fn publish_snapshot(
    ledger: &Arc<PositionLedger>,
    health: &Arc<HealthRegistry>,
    publisher: &Arc<dyn StatePublisher>,
) {
    let checkpoint = ledger.checkpoint().await;
    publisher.publish_state(&PipelineSnapshot {
        timestamp: Utc::now(),
        stages: health.statuses(),
        positions: checkpoint.positions,
        in_flight_orders: checkpoint.open_orders.len(),
    });
}
