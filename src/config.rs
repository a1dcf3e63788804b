use serde::Deserialize;

use crate::Result;

/// Runtime configuration, loaded from `Signalbot.toml` plus `SIGNALBOT_*`
/// environment overrides (e.g. `SIGNALBOT_RISK__MAX_SYMBOL_QUANTITY=2.0`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub extract: ExtractConfig,
    pub risk: RiskConfig,
    pub pipeline: PipelineConfig,
    pub exchange: ExchangeConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Intents below this confidence are discarded at the extractor
    pub min_confidence: f64,
    /// Bounded requeue budget for transient classifier failures
    pub max_retries: u32,
    /// Classifier call timeout in seconds
    pub timeout_secs: u64,
    /// "rules" or "llm"
    pub classifier: String,
    /// Suggested size when the message names none
    pub default_size: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Max open automated orders per symbol
    pub max_in_flight_per_symbol: usize,
    /// Max absolute position quantity per symbol
    pub max_symbol_quantity: f64,
    /// Max aggregate notional exposure across all symbols
    pub max_notional_exposure: f64,
    /// Max new plans per rolling window
    pub max_plans_per_window: u32,
    pub rate_window_secs: u64,
    /// Second confidence gate applied at plan time
    pub min_confidence: f64,
    /// Exchange lot step; quantities round down to a multiple of this
    pub lot_size: f64,
    /// Daily realized loss that halts new entries
    pub max_daily_loss: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each inter-stage queue
    pub queue_depth: usize,
    /// Inbound raw messages older than this are dropped unread
    pub max_signal_age_secs: u64,
    /// Inbound buffer capacity before age-based eviction kicks in
    pub inbound_buffer: usize,
    pub max_stage_restarts: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// "paper" or "rest"
    pub venue: String,
    pub rest_url: String,
    pub timeout_secs: u64,
    pub max_requests_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            extract: ExtractConfig::default(),
            risk: RiskConfig::default(),
            pipeline: PipelineConfig::default(),
            exchange: ExchangeConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            max_retries: 3,
            timeout_secs: 15,
            classifier: "rules".to_string(),
            default_size: 1.0,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_symbol: 1,
            max_symbol_quantity: 1.0,
            max_notional_exposure: 100_000.0,
            max_plans_per_window: 10,
            rate_window_secs: 60,
            min_confidence: 0.5,
            lot_size: 0.0001,
            max_daily_loss: 5_000.0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            max_signal_age_secs: 300,
            inbound_buffer: 256,
            max_stage_restarts: 5,
            backoff_base_secs: 1,
            backoff_cap_secs: 60,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            venue: "paper".to_string(),
            rest_url: "http://localhost:8787".to_string(),
            timeout_secs: 10,
            max_requests_per_minute: 60,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("Signalbot").required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("SIGNALBOT").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.risk.max_in_flight_per_symbol, 1);
        assert_eq!(cfg.extract.min_confidence, 0.5);
        assert_eq!(cfg.pipeline.queue_depth, 64);
        assert_eq!(cfg.exchange.venue, "paper");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let cfg = AppConfig::load(None).unwrap();
        assert_eq!(cfg.risk.max_plans_per_window, 10);
        assert_eq!(cfg.pipeline.max_stage_restarts, 5);
    }
}
