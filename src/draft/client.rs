use super::DraftBackend;
use crate::config::LlmConfig;
use crate::util::truncate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// OpenRouter-compatible chat completion client.
pub struct OpenRouterClient {
    http: reqwest::Client,
    url: String,
    model: String,
    max_tokens: u32,
    api_key: String,
}

impl OpenRouterClient {
    pub fn new(config: &LlmConfig, api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            url: config.api_url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            api_key,
        })
    }

    /// Client using the key from the environment or keychain.
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let key = crate::config::api_key().ok_or_else(|| {
            anyhow::anyhow!(
                "No API key configured. Set SELFPATCH_API_KEY or run `selfpatch set-api-key`."
            )
        })?;
        Self::new(config, key)
    }
}

#[async_trait]
impl DraftBackend for OpenRouterClient {
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .http
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Title", "selfpatch")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                return parse_content(&text);
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let wait = parse_retry_after(&text).unwrap_or_else(|| backoff_secs(retry_count));
                tracing::warn!(
                    wait_secs = wait,
                    attempt = retry_count,
                    max = MAX_RETRIES,
                    "drafting backend rate limited, retrying"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => "Invalid API key. Run `selfpatch set-api-key` to update it.".to_string(),
                429 => format!(
                    "Rate limited by the drafting backend after {} retries. Try again later.",
                    retry_count
                ),
                500..=599 => format!(
                    "Drafting backend server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, truncate(&text, 200)),
            };
            return Err(anyhow::anyhow!("{}", message));
        }
    }
}

fn parse_content(body: &str) -> anyhow::Result<String> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse drafting response: {}\n{}",
            e,
            truncate(body, 500)
        )
    })?;
    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default())
}

fn backoff_secs(attempt: u32) -> u64 {
    INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(attempt.saturating_sub(1)) / 1000
}

/// Seconds hinted by a "retry after N seconds" style message, if any.
fn parse_retry_after(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    let pos = lower.find("retry")?;
    lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}
