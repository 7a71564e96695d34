//! Wire types for the OpenAI-shaped chat completion contract (spec §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of one message in a chat completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request, serialized exactly per spec §6: `max_tokens`
/// omitted when unset, every other key always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.1,
            max_tokens: None,
            top_p: 0.9,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stream: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Rough char/4 token estimate used for validation and rate limiting,
    /// matching the grounding source's `estimate_tokens` (kept verbatim per
    /// SPEC_FULL.md §9's decision not to "fix" the known bias).
    pub fn estimate_input_tokens(&self) -> u64 {
        let total_chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        (total_chars as u64 / 4).max(1)
    }

    /// Validation pipeline step 1 of §4.D: non-empty messages, temperature
    /// and top_p ranges. Model-supported and context-length checks are the
    /// caller's (Provider's) responsibility since they need model metadata.
    pub fn validate_shape(&self) -> crate::error::Result<()> {
        if self.messages.is_empty() {
            return Err(crate::error::Error::model_validation(
                "request has no messages",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(crate::error::Error::model_validation(format!(
                "temperature {} out of range [0, 2]",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(crate::error::Error::model_validation(format!(
                "top_p {} out of range [0, 1]",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A completed chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
}

impl ChatResponse {
    pub fn is_complete(&self) -> bool {
        self.finish_reason.as_deref() == Some("stop")
    }

    pub fn was_truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_tokens_omitted_when_unset() {
        let req = ChatRequest::new("qwen-coder", vec![ChatMessage::user("hi")]);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn max_tokens_present_when_set() {
        let req =
            ChatRequest::new("qwen-coder", vec![ChatMessage::user("hi")]).with_max_tokens(512);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json.get("max_tokens").unwrap(), 512);
    }

    #[test]
    fn estimate_uses_chars_over_four() {
        let req = ChatRequest::new("m", vec![ChatMessage::user("a".repeat(400))]);
        assert_eq!(req.estimate_input_tokens(), 100);
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let req = ChatRequest::new("m", vec![]);
        assert!(req.validate_shape().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_temperature() {
        let req = ChatRequest::new("m", vec![ChatMessage::user("x")]).with_temperature(3.0);
        assert!(req.validate_shape().is_err());
    }
}
