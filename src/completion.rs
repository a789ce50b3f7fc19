//! Grounded answer generation.
//!
//! Builds the two-message prompt (fixed reviewer instruction plus
//! context-and-question) and sends it to a hosted chat-completions deployment.
//! Replies are returned with HTML tags removed.
//!
//! Transient failures (HTTP 429, 5xx, network errors) are retried with
//! exponential backoff up to `completion.max_retries` times. Other client
//! errors fail immediately.
//!
//! # Environment Variables
//!
//! - `AZURE_OPENAI_API_KEY`: sent as the `api-key` header

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::models::ChatMessage;

/// Reply used whenever the supplied context does not contain the answer.
pub const REFUSAL_MESSAGE: &str = "I sorry I don't have any context with that detail.";

/// Instruction sent as the system message of every completion request.
pub fn system_instruction() -> String {
    format!(
        "You are a lead document reviewer. Only answer using the provided document context below. \
         Do NOT use any external sources, web search, or your own general knowledge. \
         If the answer is not found in the context, reply with: '{}'\n\
         Always provide the reference to the source document or section and provide a link if possible. \
         If the user asks for comparisons between classifications, only use the context provided for each classification.",
        REFUSAL_MESSAGE
    )
}

/// The system and user messages for one question.
pub fn build_prompt(question: &str, context: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new("system", system_instruction()),
        ChatMessage::new(
            "user",
            format!("Context:\n{}\n\nQuestion: {}", context, question),
        ),
    ]
}

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Remove anything that looks like an HTML tag.
pub fn strip_html_tags(text: &str) -> String {
    HTML_TAG.replace_all(text, "").into_owned()
}

/// Fixed sampling parameters for every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl From<&CompletionConfig> for SamplingParams {
    fn from(config: &CompletionConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
        }
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Request one non-streamed completion and return the raw message text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Ask `client` to answer `question` from `context`, returning tag-stripped text.
pub async fn answer(client: &dyn CompletionClient, question: &str, context: &str) -> Result<String> {
    let messages = build_prompt(question, context);
    let raw = client.complete(&messages).await?;
    Ok(strip_html_tags(&raw))
}

// ============ Azure OpenAI ============

pub struct AzureOpenAiClient {
    client: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    api_key: String,
    params: SamplingParams,
    max_retries: u32,
}

impl AzureOpenAiClient {
    pub fn new(config: &CompletionConfig, client: reqwest::Client) -> Result<Self> {
        let api_key = std::env::var("AZURE_OPENAI_API_KEY")
            .context("AZURE_OPENAI_API_KEY environment variable not set")?;
        Ok(Self::with_key(config, client, api_key))
    }

    pub fn with_key(config: &CompletionConfig, client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            deployment: config.deployment.clone(),
            api_version: config.api_version.clone(),
            api_key,
            params: SamplingParams::from(config),
            max_retries: config.max_retries,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        serde_json::json!({
            "messages": messages,
            "max_tokens": self.params.max_tokens,
            "temperature": self.params.temperature,
            "top_p": self.params.top_p,
            "frequency_penalty": self.params.frequency_penalty,
            "presence_penalty": self.params.presence_penalty,
            "stop": null,
            "stream": false,
        })
    }
}

#[async_trait]
impl CompletionClient for AzureOpenAiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = self.request_body(messages);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            tracing::debug!(deployment = %self.deployment, attempt, "requesting completion");
            let resp = self
                .client
                .post(self.url())
                .header("api-key", &self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_completion_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Completion service error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Completion service error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Completion failed after retries")))
    }
}

/// `choices[0].message.content`; a null content is an empty reply.
fn parse_completion_response(json: &serde_json::Value) -> Result<String> {
    let message = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices[0].message"))?;

    Ok(message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CompletionConfig {
        CompletionConfig {
            endpoint: "https://llm.example.net/".into(),
            deployment: "gpt-4o".into(),
            api_version: "2024-12-01-preview".into(),
            max_tokens: 800,
            temperature: 0.2,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_context_chars: 48_000,
            max_retries: 0,
        }
    }

    #[test]
    fn prompt_embeds_context_then_question() {
        let messages = build_prompt("Who approves leave?", "Managers approve leave.");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains(REFUSAL_MESSAGE));
        assert!(messages[0].content.contains("source document or section"));
        assert_eq!(messages[1].role, "user");
        assert_eq!(
            messages[1].content,
            "Context:\nManagers approve leave.\n\nQuestion: Who approves leave?"
        );
    }

    #[test]
    fn html_tags_removed() {
        assert_eq!(
            strip_html_tags("<p>See <b>policy.txt</b> section 2.</p><br/>"),
            "See policy.txt section 2."
        );
        assert_eq!(strip_html_tags("a < b and c > d"), "a < b and c > d");
    }

    #[test]
    fn request_body_carries_sampling_params() {
        let client = AzureOpenAiClient::with_key(&config(), reqwest::Client::new(), "k".into());
        let body = client.request_body(&build_prompt("q", "c"));
        assert_eq!(body["max_tokens"], 800);
        assert_eq!(body["stream"], false);
        assert!(body["stop"].is_null());
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(
            client.url(),
            "https://llm.example.net/openai/deployments/gpt-4o/chat/completions?api-version=2024-12-01-preview"
        );
    }

    #[test]
    fn response_parsing() {
        let json = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Managers."}}]
        });
        assert_eq!(parse_completion_response(&json).unwrap(), "Managers.");

        let null_content = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": null}}]
        });
        assert_eq!(parse_completion_response(&null_content).unwrap(), "");

        assert!(parse_completion_response(&serde_json::json!({"choices": []})).is_err());
    }

    struct Echo;

    #[async_trait]
    impl CompletionClient for Echo {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            Ok(format!("<i>{}</i>", messages.len()))
        }
    }

    #[tokio::test]
    async fn answer_strips_tags() {
        assert_eq!(answer(&Echo, "q", "c").await.unwrap(), "2");
    }
}
