// Signal extraction module
pub mod llm;
pub mod rules;

pub use llm::LlmClassifier;
pub use rules::RuleClassifier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ExtractConfig;
use crate::models::{Direction, RawSignal, TradeIntent};
use crate::Result;

/// Why a raw signal did not become an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("no known symbol in message")]
    NoSymbolFound,
    #[error("direction unclear or contradictory")]
    AmbiguousDirection,
    #[error("confidence below extraction threshold")]
    LowConfidence,
    #[error("message is not parseable text")]
    MalformedText,
    #[error("classifier unavailable")]
    TransientError,
}

impl RejectReason {
    /// Transient rejections are requeued by the pipeline up to a bounded
    /// retry count; the rest are final
    pub fn is_transient(self) -> bool {
        matches!(self, RejectReason::TransientError)
    }
}

/// What a classification backend reads out of the message text
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub confidence: f64,
    pub suggested_size: Option<f64>,
}

/// Classification backend. The pipeline depends only on this trait so the
/// backend can be swapped between the rule lexicon and a model call.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification>;

    fn name(&self) -> &str;
}

/// Turns raw chat messages into trade intents.
///
/// Stateless apart from the classifier handle; safe to call concurrently
/// for multiple in-flight messages.
pub struct SignalExtractor {
    classifier: Arc<dyn Classifier>,
    min_confidence: f64,
    default_size: f64,
    call_timeout: Duration,
}

impl SignalExtractor {
    pub fn new(classifier: Arc<dyn Classifier>, config: &ExtractConfig) -> Self {
        Self {
            classifier,
            min_confidence: config.min_confidence,
            default_size: config.default_size,
            call_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub async fn extract(&self, signal: &RawSignal) -> std::result::Result<TradeIntent, RejectReason> {
        let text = signal.raw_text.trim();
        if text.is_empty() || text.chars().all(|c| !c.is_alphanumeric()) {
            return Err(RejectReason::MalformedText);
        }

        let classification =
            match tokio::time::timeout(self.call_timeout, self.classifier.classify(text)).await {
                Ok(Ok(c)) => c,
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Classifier {} failed on {}: {}",
                        self.classifier.name(),
                        signal.source_id,
                        e
                    );
                    return Err(RejectReason::TransientError);
                }
                Err(_) => {
                    tracing::warn!(
                        "Classifier {} timed out on {}",
                        self.classifier.name(),
                        signal.source_id
                    );
                    return Err(RejectReason::TransientError);
                }
            };

        let symbol = classification.symbol.ok_or(RejectReason::NoSymbolFound)?;
        let direction = classification
            .direction
            .ok_or(RejectReason::AmbiguousDirection)?;

        if classification.confidence < self.min_confidence {
            return Err(RejectReason::LowConfidence);
        }

        Ok(TradeIntent {
            intent_id: Uuid::new_v4(),
            symbol,
            direction,
            confidence: classification.confidence.clamp(0.0, 1.0),
            suggested_size: classification.suggested_size.unwrap_or(self.default_size),
            extracted_from: signal.source_id.clone(),
        })
    }
}
