/// Model-backed classification using an OpenAI-compatible chat API.
///
/// The model reads the raw message and answers with strict JSON; anything
/// else is retried and eventually surfaced as a transient failure.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::extract::{Classification, Classifier};
use crate::models::Direction;
use crate::Result;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";
const MAX_TOKENS: u32 = 256;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModelAnswer {
    symbol: Option<String>,
    direction: Option<String>,
    confidence: f64,
    #[serde(default)]
    suggested_size: Option<f64>,
}

const SYSTEM_PROMPT: &str = "You are an expert crypto trading-desk analyst. \
Given one chat message, decide whether it announces a trade. Always respond \
with valid JSON only, no markdown formatting.";

pub struct LlmClassifier {
    api_key: String,
    api_url: String,
    client: reqwest::Client,
    retry_delay_ms: u64,
    // Cache responses to avoid duplicate API spend on replayed messages
    cache: Mutex<HashMap<String, Classification>>,
}

impl LlmClassifier {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            api_url: DEFAULT_API_URL.to_string(),
            client: reqwest::Client::new(),
            retry_delay_ms: RETRY_DELAY_MS,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Point at a different endpoint (tests, proxies)
    pub fn with_api_url(mut self, api_url: String) -> Self {
        self.api_url = api_url;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    fn prompt(text: &str) -> String {
        format!(
            r#"Message:
"{text}"

Does this message announce a trade? Respond ONLY with valid JSON (no
markdown, no code blocks):

{{
  "symbol": "BTC" or null,
  "direction": "long" | "short" | "close" | null,
  "confidence": 0.85,
  "suggested_size": 0.5 or null
}}

Rules:
- symbol: the base asset ticker, uppercase, null if no asset is named
- direction: null when unclear or contradictory
- confidence 0.0-1.0: how clearly this is an actionable signal; hedged or
  joking messages score low
- suggested_size: only if the author names a quantity"#
        )
    }

    fn parse_answer(text: &str) -> Result<Classification> {
        let mut text = text.trim();

        // Strip markdown code blocks (```json ... ``` or ``` ... ```)
        if text.starts_with("```") {
            text = text
                .trim_start_matches("```json")
                .trim_start_matches("```")
                .trim_end_matches("```")
                .trim();
        }

        let answer: ModelAnswer = serde_json::from_str(text)?;

        let direction = match answer.direction.as_deref() {
            Some("long") => Some(Direction::Long),
            Some("short") => Some(Direction::Short),
            Some("close") => Some(Direction::Close),
            _ => None,
        };

        Ok(Classification {
            symbol: answer.symbol.map(|s| s.to_uppercase()),
            direction,
            confidence: answer.confidence.clamp(0.0, 1.0),
            suggested_size: answer.suggested_size.filter(|s| *s > 0.0),
        })
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, text: &str) -> Result<Classification> {
        if let Some(cached) = self.cache.lock().unwrap().get(text) {
            return Ok(cached.clone());
        }

        let request = ChatRequest {
            model: MODEL.to_string(),
            max_tokens: MAX_TOKENS,
            temperature: 0.0,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: Self::prompt(text),
                },
            ],
        };

        let mut last_error = String::new();

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay_ms = self.retry_delay_ms * 2u64.pow(attempt - 1);
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }

            let response = match self
                .client
                .post(&self.api_url)
                .header("Authorization", format!("Bearer {}", &self.api_key))
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("Network error: {e}");
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                last_error = format!("Model API error {status}: {body}");

                // Retry rate limits and server errors, nothing else
                if status.as_u16() == 429 || status.is_server_error() {
                    continue;
                }
                return Err(last_error.into());
            }

            let chat: ChatResponse = match response.json().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("JSON decode error: {e}");
                    continue;
                }
            };

            let content = match chat.choices.first() {
                Some(choice) => choice.message.content.clone(),
                None => {
                    last_error = "empty choices in model response".to_string();
                    continue;
                }
            };

            match Self::parse_answer(&content) {
                Ok(classification) => {
                    self.cache
                        .lock()
                        .unwrap()
                        .insert(text.to_string(), classification.clone());
                    return Ok(classification);
                }
                Err(e) => {
                    last_error = format!("Answer parse error: {e} (text: {content})");
                    continue;
                }
            }
        }

        Err(last_error.into())
    }

    fn name(&self) -> &str {
        "llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(content: &str) -> String {
        serde_json::json!({
            "choices": [{"message": {"content": content}}]
        })
        .to_string()
    }

    fn classifier(url: String) -> LlmClassifier {
        LlmClassifier::new("test-key".to_string())
            .with_api_url(url)
            .with_retry_delay_ms(1)
    }

    #[tokio::test]
    async fn test_parses_model_answer() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body(
                r#"{"symbol": "btc", "direction": "long", "confidence": 0.85}"#,
            ))
            .create_async()
            .await;

        let c = classifier(server.url()).classify("long BTC").await.unwrap();
        assert_eq!(c.symbol.as_deref(), Some("BTC"));
        assert_eq!(c.direction, Some(Direction::Long));
        assert_eq!(c.confidence, 0.85);
    }

    #[tokio::test]
    async fn test_strips_markdown_fences() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(body(
                "```json\n{\"symbol\": \"ETH\", \"direction\": \"short\", \"confidence\": 0.7}\n```",
            ))
            .create_async()
            .await;

        let c = classifier(server.url()).classify("short ETH").await.unwrap();
        assert_eq!(c.symbol.as_deref(), Some("ETH"));
        assert_eq!(c.direction, Some(Direction::Short));
    }

    #[tokio::test]
    async fn test_confidence_clamped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(body(
                r#"{"symbol": "BTC", "direction": "long", "confidence": 1.7}"#,
            ))
            .create_async()
            .await;

        let c = classifier(server.url()).classify("LONG BTC!!").await.unwrap();
        assert_eq!(c.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_fails() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(500)
            .with_body("boom")
            .expect(3)
            .create_async()
            .await;

        let result = classifier(server.url()).classify("long BTC").await;
        assert!(result.is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(401)
            .with_body("bad key")
            .expect(1)
            .create_async()
            .await;

        let result = classifier(server.url()).classify("long BTC").await;
        assert!(result.is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_caches_answers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(body(
                r#"{"symbol": "SOL", "direction": "long", "confidence": 0.8}"#,
            ))
            .expect(1)
            .create_async()
            .await;

        let classifier = classifier(server.url());
        classifier.classify("long SOL").await.unwrap();
        classifier.classify("long SOL").await.unwrap();
        mock.assert_async().await;
    }
}
