use async_trait::async_trait;
use std::collections::HashMap;

use crate::extract::{Classification, Classifier};
use crate::models::Direction;
use crate::Result;

/// Symbols recognized out of the box; callers extend via `with_symbols`
const DEFAULT_SYMBOLS: &[(&str, &str)] = &[
    ("BTC", "BTC"),
    ("BITCOIN", "BTC"),
    ("XBT", "BTC"),
    ("ETH", "ETH"),
    ("ETHEREUM", "ETH"),
    ("SOL", "SOL"),
    ("SOLANA", "SOL"),
    ("BNB", "BNB"),
    ("XRP", "XRP"),
    ("ADA", "ADA"),
    ("DOGE", "DOGE"),
];

/// Strong directional verbs carry more weight than plain buy/sell chatter
const STRONG_LONG: &[&str] = &["long", "做多"];
const STRONG_SHORT: &[&str] = &["short", "做空"];
const WEAK_LONG: &[&str] = &["buy", "entry", "enter", "accumulate", "买入"];
const CLOSE_CUES: &[&str] = &["close", "sell", "exit", "tp", "卖出", "平仓"];

const HEDGE_WORDS: &[&str] = &["maybe", "might", "thinking", "possibly", "considering"];

const STRONG_CONFIDENCE: f64 = 0.9;
const WEAK_CONFIDENCE: f64 = 0.65;
const HEDGE_PENALTY: f64 = 0.5;

/// Lexicon-driven classifier: known tickers plus the directional vocabulary
/// signal callers actually use, including the CJK trading verbs.
pub struct RuleClassifier {
    symbols: HashMap<String, String>,
}

impl RuleClassifier {
    pub fn new() -> Self {
        let symbols = DEFAULT_SYMBOLS
            .iter()
            .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
            .collect();
        Self { symbols }
    }

    /// Extend the recognized lexicon (alias -> canonical symbol)
    pub fn with_symbols(mut self, extra: &[(&str, &str)]) -> Self {
        for (alias, canonical) in extra {
            self.symbols
                .insert(alias.to_uppercase(), canonical.to_uppercase());
        }
        self
    }

    fn find_symbol(&self, tokens: &[String]) -> Option<String> {
        for token in tokens {
            // "$BTC" style cashtags resolve through the same lexicon
            let bare = token.trim_start_matches('$');
            if let Some(canonical) = self.symbols.get(bare) {
                return Some(canonical.clone());
            }
            // "BTCUSDT" / "BTC/USDT" quote-pair forms
            for suffix in ["USDT", "USD", "/USDT", "/USD"] {
                if let Some(stripped) = bare.strip_suffix(suffix) {
                    let stripped = stripped.trim_end_matches('/');
                    if let Some(canonical) = self.symbols.get(stripped) {
                        return Some(canonical.clone());
                    }
                }
            }
        }
        None
    }

    fn find_direction(&self, text: &str, tokens: &[String]) -> (Option<Direction>, f64) {
        let has = |cues: &[&str]| {
            cues.iter().any(|cue| {
                if cue.is_ascii() {
                    tokens.iter().any(|t| t.eq_ignore_ascii_case(cue))
                } else {
                    text.contains(cue)
                }
            })
        };

        let strong_long = has(STRONG_LONG);
        let strong_short = has(STRONG_SHORT);
        let weak_long = has(WEAK_LONG);
        let close = has(CLOSE_CUES);

        // Contradictory cues: refuse to guess
        if (strong_long || weak_long) && strong_short {
            return (None, 0.0);
        }

        if strong_long {
            (Some(Direction::Long), STRONG_CONFIDENCE)
        } else if strong_short {
            (Some(Direction::Short), STRONG_CONFIDENCE)
        } else if close {
            (Some(Direction::Close), WEAK_CONFIDENCE)
        } else if weak_long {
            (Some(Direction::Long), WEAK_CONFIDENCE)
        } else {
            (None, 0.0)
        }
    }

    /// A number following a size cue ("size 0.5", "qty 2") is the
    /// author's suggested quantity
    fn find_size(&self, tokens: &[String]) -> Option<f64> {
        for window in tokens.windows(2) {
            let cue = window[0].to_ascii_lowercase();
            if cue == "size" || cue == "qty" || cue == "amount" {
                if let Ok(value) = window[1].parse::<f64>() {
                    if value > 0.0 && value.is_finite() {
                        return Some(value);
                    }
                }
            }
        }
        None
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(&self, text: &str) -> Result<Classification> {
        let tokens: Vec<String> = text
            .split_whitespace()
            .map(|t| {
                t.trim_matches(|c: char| c.is_ascii_punctuation() && c != '$' && c != '/')
                    .to_uppercase()
            })
            .filter(|t| !t.is_empty())
            .collect();

        let symbol = self.find_symbol(&tokens);
        let (direction, mut confidence) = self.find_direction(text, &tokens);

        let lowered = text.to_lowercase();
        if lowered.contains('?') || HEDGE_WORDS.iter().any(|w| lowered.contains(w)) {
            confidence *= HEDGE_PENALTY;
        }

        Ok(Classification {
            symbol,
            direction,
            confidence,
            suggested_size: self.find_size(&tokens),
        })
    }

    fn name(&self) -> &str {
        "rules"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn classify(text: &str) -> Classification {
        RuleClassifier::new().classify(text).await.unwrap()
    }

    #[tokio::test]
    async fn test_strong_long_signal() {
        let c = classify("LONG $BTC here, target 70k").await;
        assert_eq!(c.symbol.as_deref(), Some("BTC"));
        assert_eq!(c.direction, Some(Direction::Long));
        assert!(c.confidence >= 0.9);
    }

    #[tokio::test]
    async fn test_short_signal() {
        let c = classify("opening a short on ETH").await;
        assert_eq!(c.symbol.as_deref(), Some("ETH"));
        assert_eq!(c.direction, Some(Direction::Short));
    }

    #[tokio::test]
    async fn test_cjk_vocabulary() {
        let c = classify("BTC 做多 现价").await;
        assert_eq!(c.symbol.as_deref(), Some("BTC"));
        assert_eq!(c.direction, Some(Direction::Long));

        let c = classify("卖出 SOL").await;
        assert_eq!(c.direction, Some(Direction::Close));
    }

    #[tokio::test]
    async fn test_quote_pair_symbol() {
        let c = classify("buy BTCUSDT now").await;
        assert_eq!(c.symbol.as_deref(), Some("BTC"));
        assert_eq!(c.direction, Some(Direction::Long));
    }

    #[tokio::test]
    async fn test_contradictory_cues_are_ambiguous() {
        let c = classify("long or short BTC? no idea").await;
        assert_eq!(c.direction, None);
    }

    #[tokio::test]
    async fn test_hedging_halves_confidence() {
        let plain = classify("long BTC").await;
        let hedged = classify("maybe long BTC?").await;
        assert!(hedged.confidence < plain.confidence);
    }

    #[tokio::test]
    async fn test_no_symbol() {
        let c = classify("going long on something tomorrow").await;
        assert_eq!(c.symbol, None);
        assert_eq!(c.direction, Some(Direction::Long));
    }

    #[tokio::test]
    async fn test_size_cue() {
        let c = classify("long SOL size 2.5").await;
        assert_eq!(c.suggested_size, Some(2.5));

        let c = classify("long SOL, big position").await;
        assert_eq!(c.suggested_size, None);
    }

    #[tokio::test]
    async fn test_custom_symbols() {
        let classifier = RuleClassifier::new().with_symbols(&[("WIF", "WIF")]);
        let c = classifier.classify("long $WIF").await.unwrap();
        assert_eq!(c.symbol.as_deref(), Some("WIF"));
    }
}
