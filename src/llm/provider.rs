//! LLM provider trait and the OpenAI-shaped HTTP implementation (spec §4.D).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::llm::rate_limiter::RateLimiter;
use crate::llm::types::{ChatRequest, ChatResponse, TokenUsage};

/// Maximum context length per known model, used by request validation.
fn max_context_length(model: &str) -> u32 {
    match model {
        "Qwen/Qwen3-Coder-30B-A3B-Instruct" => 262_144,
        "moonshotai/Kimi-K2-Instruct" => 128_000,
        _ => 4096,
    }
}

/// An LLM backend. Implementations perform validation, rate limiting,
/// the HTTP call, and retry classification internally; callers only see
/// the final response or a classified [`Error`].
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn supported_models(&self) -> &[String];
    fn is_model_supported(&self, model: &str) -> bool {
        self.supported_models().iter().any(|m| m == model)
    }
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse>;
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("failed to build fallback HTTP client"),
    }
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// An OpenAI-shaped provider (qwen, kimi) reached over HTTP.
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: String,
    supported_models: Vec<String>,
    http: Client,
    rate_limiter: RateLimiter,
    max_retries: u32,
    max_retry_delay_secs: f64,
}

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        supported_models: Vec<String>,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            supported_models,
            http: build_http_client(120),
            rate_limiter,
            max_retries: 4,
            max_retry_delay_secs: 60.0,
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    fn validate(&self, request: &ChatRequest) -> Result<()> {
        request.validate_shape()?;
        if !self.is_model_supported(&request.model) {
            return Err(Error::model_validation(format!(
                "model '{}' not supported by provider '{}'",
                request.model, self.name
            )));
        }
        let max_context = max_context_length(&request.model) as u64;
        let estimated = request.estimate_input_tokens();
        if estimated as f64 > 0.8 * max_context as f64 {
            warn!(
                provider = %self.name,
                model = %request.model,
                estimated,
                max_context,
                "request approaches model context limit"
            );
        }
        Ok(())
    }

    async fn call_once(&self, request: &ChatRequest) -> Result<(ChatResponse, u64)> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let start = Instant::now();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if status.as_u16() == 401 {
            return Err(Error::authentication(self.name.clone()));
        }
        if status.as_u16() == 429 {
            return Err(Error::rate_limit(self.name.clone(), 1000));
        }
        if status.is_server_error() {
            return Err(Error::server_error(self.name.clone(), status.as_u16()));
        }
        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(Error::model_validation(format!(
                "provider '{}' returned {}: {}",
                self.name, status, message
            )));
        }

        let parsed: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::parse(format!("malformed provider response: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::parse("provider returned no choices"))?;

        Ok((
            ChatResponse {
                content: choice.message.content,
                model: request.model.clone(),
                usage: TokenUsage {
                    prompt_tokens: parsed.usage.prompt_tokens,
                    completion_tokens: parsed.usage.completion_tokens,
                    total_tokens: parsed.usage.total_tokens,
                },
                finish_reason: choice.finish_reason,
                response_time_ms: elapsed_ms,
                timestamp: Utc::now(),
                provider: self.name.clone(),
            },
            parsed.usage.total_tokens,
        ))
    }

    fn backoff_delay(&self, error: &Error, attempt: u32) -> Duration {
        let base = error.backoff_base();
        let delay = (error.backoff_leading_factor() * base.powi(attempt as i32))
            .min(self.max_retry_delay_secs);
        Duration::from_secs_f64(delay)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_models(&self) -> &[String] {
        &self.supported_models
    }

    #[instrument(skip(self, request), fields(provider = %self.name, model = %request.model))]
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.validate(&request)?;

        let content_len: usize = request.messages.iter().map(|m| m.content.len()).sum();
        let estimate = self
            .rate_limiter
            .acquire_with_estimation(Some(content_len))
            .await;
        let _ = estimate;

        let mut attempt = 0;
        loop {
            match self.call_once(&request).await {
                Ok((response, total_tokens)) => {
                    self.rate_limiter.record_actual_usage(total_tokens).await;
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    self.rate_limiter.record_error().await;
                    let delay = self.backoff_delay(&err, attempt);
                    debug!(
                        provider = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after classified error: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.rate_limiter.record_error().await;
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimiterConfig;
    use crate::llm::types::ChatMessage;

    fn provider() -> HttpProvider {
        HttpProvider::new(
            "qwen",
            "https://api.example.com/v1",
            "key",
            vec!["Qwen/Qwen3-Coder-30B-A3B-Instruct".into()],
            RateLimiter::new("qwen", RateLimiterConfig::default()),
        )
    }

    #[test]
    fn rejects_unsupported_model() {
        let p = provider();
        let req = ChatRequest::new("not-a-model", vec![ChatMessage::user("hi")]);
        assert!(p.validate(&req).is_err());
    }

    #[test]
    fn accepts_supported_model() {
        let p = provider();
        let req = ChatRequest::new(
            "Qwen/Qwen3-Coder-30B-A3B-Instruct",
            vec![ChatMessage::user("hi")],
        );
        assert!(p.validate(&req).is_ok());
    }

    #[test]
    fn backoff_delay_follows_status_classifier() {
        let p = provider();
        let err502 = Error::server_error("qwen", 502);
        let err503 = Error::server_error("qwen", 503);
        assert_eq!(p.backoff_delay(&err502, 1).as_secs_f64(), 4.0);
        assert_eq!(p.backoff_delay(&err503, 1).as_secs_f64(), 5.0);
    }

    #[test]
    fn backoff_delay_applies_timeout_leading_factor() {
        let p = provider();
        let err = Error::timeout(1000);
        // 1s * 1.5 * 2^1 = 3.0s
        assert_eq!(p.backoff_delay(&err, 1).as_secs_f64(), 3.0);
    }

    #[test]
    fn backoff_delay_caps_at_max_retry_delay() {
        let p = provider();
        let err = Error::server_error("qwen", 503);
        let delay = p.backoff_delay(&err, 10);
        assert_eq!(delay.as_secs_f64(), 60.0);
    }
}
