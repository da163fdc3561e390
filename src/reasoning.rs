//! Stance classifiers used by flip detection.
//!
//! `[reasoning].provider` selects one of:
//!
//! | Value | Classifier |
//! |-------|------------|
//! | `"keyword"` | [`KeywordStanceClassifier`], offline lexicon rules |
//! | `"openai"` | [`OpenAIStanceClassifier`], a chat-completions call per quote |
//! | `"disabled"` | [`DisabledClassifier`], flip questions report the provider as unavailable |

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chat_recall_core::error::ProviderError;
use chat_recall_core::models::Stance;
use chat_recall_core::stance::{KeywordStanceClassifier, StanceClassifier};

use crate::config::ReasoningConfig;
use crate::retry::{classify_reqwest, classify_status, with_retry, RetryPolicy};

const BACKOFF_BASE_MS: u64 = 1000;

pub fn create_classifier(config: &ReasoningConfig) -> Result<Arc<dyn StanceClassifier>> {
    match config.provider.as_str() {
        "keyword" => Ok(Arc::new(KeywordStanceClassifier::new())),
        "openai" => Ok(Arc::new(OpenAIStanceClassifier::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledClassifier)),
        other => bail!("Unknown reasoning provider: {}", other),
    }
}

pub struct DisabledClassifier;

#[async_trait]
impl StanceClassifier for DisabledClassifier {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn classify_stance(&self, _topic: &str, _quotes: &[String]) -> Result<Stance, ProviderError> {
        Err(ProviderError::Permanent(
            "stance classification is disabled; set [reasoning].provider".to_string(),
        ))
    }
}

/// Asks a chat model for one word: positive, negative, neutral, or unknown.
pub struct OpenAIStanceClassifier {
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAIStanceClassifier {
    pub fn new(config: &ReasoningConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("reasoning.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: reqwest::Client::builder().build()?,
            model,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            retry: RetryPolicy::new(config.max_retries, BACKOFF_BASE_MS, config.timeout_secs),
        })
    }

    async fn ask(&self, body: &serde_json::Value) -> Result<Stance, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_reqwest("OpenAI", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("OpenAI", status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest("OpenAI", e))?;
        parse_completion(&json)
    }
}

#[async_trait]
impl StanceClassifier for OpenAIStanceClassifier {
    fn name(&self) -> &str {
        &self.model
    }

    async fn classify_stance(&self, topic: &str, quotes: &[String]) -> Result<Stance, ProviderError> {
        if quotes.is_empty() {
            return Ok(Stance::Unknown);
        }
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(topic, quotes)},
            ],
        });
        with_retry(&self.retry, "OpenAI", || self.ask(&body)).await
    }
}

const SYSTEM_PROMPT: &str = "You label the stance of chat messages towards a topic. \
Messages may be in Ukrainian, Russian, or English. \
Answer with exactly one word: positive, negative, neutral, or unknown.";

fn user_prompt(topic: &str, quotes: &[String]) -> String {
    let mut out = format!("Topic: {}\n\nMessages:\n", topic);
    for q in quotes {
        out.push_str("- ");
        out.push_str(q);
        out.push('\n');
    }
    out
}

fn parse_completion(json: &serde_json::Value) -> Result<Stance, ProviderError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(Stance::parse_loose)
        .ok_or_else(|| ProviderError::Permanent("Invalid OpenAI response: missing message content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Negative."}}]
        });
        assert_eq!(parse_completion(&json).unwrap(), Stance::Negative);
        assert!(parse_completion(&serde_json::json!({"choices": []})).is_err());
    }

    #[test]
    fn test_user_prompt_lists_quotes() {
        let p = user_prompt("crypto", &["to the moon".into(), "scam".into()]);
        assert!(p.starts_with("Topic: crypto"));
        assert!(p.contains("- to the moon\n- scam\n"));
    }

    #[tokio::test]
    async fn test_keyword_and_disabled_classifiers() {
        let keyword = create_classifier(&ReasoningConfig::default()).unwrap();
        assert_eq!(keyword.name(), "keyword");

        let disabled = create_classifier(&ReasoningConfig {
            provider: "disabled".into(),
            ..ReasoningConfig::default()
        })
        .unwrap();
        assert!(disabled
            .classify_stance("crypto", &["love it".into()])
            .await
            .is_err());
    }
}
