use clap::{Parser, Subcommand};
use signalbot::config::AppConfig;
use signalbot::db::{MemoryStore, PostgresStore, StateStore};
use signalbot::exchange::{ExchangeClient, PaperExchange, RestExchange};
use signalbot::extract::{Classifier, LlmClassifier, RuleClassifier};
use signalbot::models::RawSignal;
use signalbot::notify::{LogPublisher, Notifier, NullNotifier, WebhookNotifier};
use signalbot::Pipeline;
use signalbot::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "signalbot", about = "Chat-signal trading pipeline")]
struct Cli {
    /// Path to a TOML config file (defaults to Signalbot.toml if present)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline (default)
    Run,
    /// Print non-terminal orders from the durable store and exit
    ReplayCheck,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ReplayCheck => replay_check().await,
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signalbot=info".into()),
        )
        .init();
}

async fn run(config: AppConfig) -> Result<()> {
    tracing::info!("signalbot starting");

    let store = connect_store().await;
    let classifier = build_classifier(&config)?;
    let exchange = build_exchange(&config);

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => {
            tracing::info!("Notifications to {}", url);
            Arc::new(WebhookNotifier::new(url.clone(), config.notify.timeout_secs))
        }
        None => Arc::new(NullNotifier),
    };

    tracing::info!("Configuration:");
    tracing::info!("  Venue: {}", config.exchange.venue);
    tracing::info!("  Classifier: {}", config.extract.classifier);
    tracing::info!("  Min confidence: {}", config.extract.min_confidence);
    tracing::info!("  Symbol cap: {}", config.risk.max_symbol_quantity);
    tracing::info!("  Exposure cap: {}", config.risk.max_notional_exposure);

    let pipeline = Arc::new(
        Pipeline::start(
            config,
            classifier,
            exchange,
            store,
            notifier,
            Arc::new(LogPublisher),
        )
        .await?,
    );

    // Dev source adapter: each stdin line becomes a raw signal, standing in
    // for the chat-platform client that pushes in production
    let stdin_task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut seq = 0u64;
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                seq += 1;
                pipeline.ingest(RawSignal {
                    source_id: format!("stdin-{seq}"),
                    timestamp: Utc::now(),
                    author: "stdin".to_string(),
                    raw_text: line,
                    channel: "stdin".to_string(),
                });
            }
        })
    };

    tracing::info!("Pipeline running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down");
    stdin_task.abort();
    let _ = stdin_task.await;

    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown().await,
        Err(_) => tracing::warn!("Pipeline still referenced, exiting without drain"),
    }

    tracing::info!("signalbot stopped");
    Ok(())
}

async fn replay_check() -> Result<()> {
    let store = connect_store().await;
    let open = store.load_open_orders().await?;

    if open.is_empty() {
        tracing::info!("No non-terminal orders in the durable store");
        return Ok(());
    }

    tracing::info!("{} non-terminal orders would be resynced:", open.len());
    for record in open {
        tracing::info!(
            "  {} {} {:?} x{} [{:?}] venue id {}",
            record.order_id,
            record.symbol,
            record.side,
            record.quantity,
            record.state,
            record.exchange_order_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Postgres when configured and reachable, otherwise run without durable
/// state rather than refusing to start
async fn connect_store() -> Arc<dyn StateStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("DATABASE_URL not set, running without crash recovery");
        return Arc::new(MemoryStore::new());
    };

    match PostgresStore::new(&database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without persistence",
                e
            );
            Arc::new(MemoryStore::new())
        }
    }
}

fn build_classifier(config: &AppConfig) -> Result<Arc<dyn Classifier>> {
    match config.extract.classifier.as_str() {
        "llm" => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| "OPENAI_API_KEY not found in environment")?;
            Ok(Arc::new(LlmClassifier::new(api_key)))
        }
        "rules" => Ok(Arc::new(RuleClassifier::new())),
        other => Err(format!("unknown classifier backend '{other}'").into()),
    }
}

fn build_exchange(config: &AppConfig) -> Arc<dyn ExchangeClient> {
    match config.exchange.venue.as_str() {
        "rest" => Arc::new(RestExchange::new(
            config.exchange.rest_url.clone(),
            config.exchange.timeout_secs,
            config.exchange.max_requests_per_minute,
        )) as Arc<dyn ExchangeClient>,
        _ => {
            let venue = PaperExchange::new();
            seed_paper_prices(&venue);
            Arc::new(venue)
        }
    }
}

/// Paper mode marks from SIGNALBOT_PAPER_PRICES ("BTC=50000,ETH=3000")
fn seed_paper_prices(venue: &PaperExchange) {
    let Ok(spec) = std::env::var("SIGNALBOT_PAPER_PRICES") else {
        tracing::warn!("SIGNALBOT_PAPER_PRICES not set, paper venue has no marks");
        return;
    };

    for pair in spec.split(',') {
        let Some((symbol, price)) = pair.split_once('=') else {
            continue;
        };
        match price.trim().parse::<f64>() {
            Ok(price) if price > 0.0 => {
                venue.set_price(symbol.trim(), price);
                tracing::info!("Paper mark {} @ {}", symbol.trim(), price);
            }
            _ => tracing::warn!("Ignoring malformed paper price entry '{}'", pair),
        }
    }
}
