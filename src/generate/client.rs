use super::{prompts, schema, FixRequest, GenerationError, PatchGenerator, PatchRequest};
use crate::config::Config;
use crate::patch::{self, Patch};
use crate::reflection::{IssueKind, ReflectionIssue};
use crate::util::truncate;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenRouter direct API URL
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";

const MAX_TOKENS: u32 = 16384;

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
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
    content: String,
}

/// [`PatchGenerator`] backed by OpenRouter chat completions in JSON mode
pub struct OpenRouterGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        let api_key = config.get_api_key().ok_or_else(|| {
            GenerationError::Unavailable(
                "no OpenRouter API key configured (set OPENROUTER_API_KEY)".into(),
            )
        })?;
        Ok(Self::new(api_key, config.model()))
    }

    /// One system+user exchange; 429s are retried with exponential backoff.
    async fn chat(&self, system: &str, user: &str) -> Result<String, GenerationError> {
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
            max_tokens: MAX_TOKENS,
            stream: false,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .client
                .post(OPENROUTER_URL)
                .header("Content-Type", "application/json")
                .header("X-Title", "patchloom")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    GenerationError::InvalidResponse(format!(
                        "OpenRouter envelope: {} ({})",
                        e,
                        truncate(&text, 200)
                    ))
                })?;
                return parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| GenerationError::InvalidResponse("no choices returned".into()));
            }

            if status.as_u16() == 429 {
                if retry_count >= MAX_RETRIES {
                    return Err(GenerationError::RateLimited {
                        retries: retry_count,
                    });
                }
                retry_count += 1;
                let wait = parse_retry_after(&text)
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| {
                        Duration::from_millis(
                            INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1),
                        )
                    });
                tracing::warn!(
                    attempt = retry_count,
                    max = MAX_RETRIES,
                    wait_ms = wait.as_millis() as u64,
                    "OpenRouter rate limited; retrying"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => "invalid API key".to_string(),
                500..=599 => "server error; the service may be temporarily unavailable".to_string(),
                _ => truncate(&text, 200),
            };
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }
    }
}

/// Extract a retry-after hint (seconds) from an OpenRouter error body
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

impl PatchGenerator for OpenRouterGenerator {
    fn generate_patch<'a>(
        &'a self,
        request: &'a PatchRequest,
    ) -> BoxFuture<'a, Result<Patch, GenerationError>> {
        Box::pin(async move {
            let user = prompts::patch_user_prompt(request);
            let response = self.chat(prompts::PATCH_SYSTEM, &user).await?;
            schema::parse_patch_response(&response, &request.file_path)
        })
    }

    fn generate_fix<'a>(
        &'a self,
        request: &'a FixRequest,
    ) -> BoxFuture<'a, Result<Patch, GenerationError>> {
        Box::pin(async move {
            let previous = patch::to_unified_diff(&request.patch);
            let user = prompts::fix_user_prompt(request, &previous);
            let response = self.chat(prompts::FIX_SYSTEM, &user).await?;
            schema::parse_patch_response(&response, &request.file_path)
        })
    }

    fn check_goal<'a>(
        &'a self,
        objective: &'a str,
        file_path: &'a str,
        diff: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ReflectionIssue>, GenerationError>> {
        Box::pin(async move {
            let user = prompts::goal_user_prompt(objective, file_path, diff);
            let response = self.chat(prompts::GOAL_SYSTEM, &user).await?;
            schema::parse_findings(&response, file_path, IssueKind::GoalMismatch)
        })
    }

    fn review_logic<'a>(
        &'a self,
        file_path: &'a str,
        diff: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ReflectionIssue>, GenerationError>> {
        Box::pin(async move {
            let user = prompts::logic_user_prompt(file_path, diff);
            let response = self.chat(prompts::LOGIC_SYSTEM, &user).await?;
            schema::parse_findings(&response, file_path, IssueKind::Logic)
        })
    }
}
