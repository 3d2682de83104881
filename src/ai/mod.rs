//! AI text-generation backend.
//!
//! The orchestrator and the step generator only depend on the
//! [`TextGenerator`] trait; tests substitute a scripted implementation and
//! production wires in the HTTP client below.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::AiConfig;
use crate::{Error, Result};

/// A backend that can turn a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

/// HTTP-backed text generator.
///
/// Every failure mode (connect, timeout, bad status, malformed body) comes
/// back as an `Err`; callers are expected to have a deterministic fallback
/// and never surface these to a streaming client.
pub struct HttpTextGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
    timeout: Duration,
    max_tokens: u32,
}

impl HttpTextGenerator {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            max_tokens: config.max_tokens,
        }
    }

    /// Requested token budgets are capped by the configured maximum.
    fn effective_max_tokens(&self, requested: u32) -> u32 {
        requested.min(self.max_tokens)
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let mut body = json!({
            "prompt": prompt,
            "max_tokens": self.effective_max_tokens(max_tokens),
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }

        debug!(endpoint = %self.endpoint, "sending generation request");

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Generation(format!(
                "generation backend returned status {}",
                status.as_u16()
            )));
        }

        let payload: serde_json::Value = response.json().await?;
        let text = payload
            .get("text")
            .or_else(|| payload.get("content"))
            .or_else(|| payload.get("response"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Generation("generation response had no text field".to_string()))?;

        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_max_tokens_caps_requests() {
        let config = AiConfig {
            max_tokens: 500,
            ..Default::default()
        };
        let generator = HttpTextGenerator::new(&config);

        assert_eq!(generator.effective_max_tokens(2000), 500);
        assert_eq!(generator.effective_max_tokens(100), 100);
    }
}
