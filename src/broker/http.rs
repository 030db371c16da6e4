//! OpenAI-compatible chat completion oracle.
//!
//! Works against anything serving `/chat/completions` (vLLM, Ollama,
//! OpenAI). The timeout is enforced by the broker, not here.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};

use super::{Oracle, OracleRequest};
use crate::config::OracleConfig;

const SYSTEM_PROMPT: &str = "You are the remediation planner for a fleet of services. \
You receive one incident as JSON: the incident summary, its state history, recent observations \
and the allowed action kinds. Reply with JSON only, in one of two forms: \
{\"action\": \"no-action\", \"confidence\": <0..1>} or \
{\"steps\": [{\"action_kind\": <allowed kind>, \"parameters\": {<string>: <string>}, \"timeout_ms\": <int>}], \"confidence\": <0..1>}. \
Required parameters: restart-service: service; scale-resource: resource, replicas; \
clear-disk: path (absolute); throttle-traffic: target, rate_limit; custom-command: command.";

pub struct ChatOracle {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl ChatOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .context("building oracle HTTP client")?;

        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

#[async_trait]
impl Oracle for ChatOracle {
    fn name(&self) -> &str {
        &self.model
    }

    async fn propose(&self, request: &OracleRequest) -> Result<String> {
        let user = request.to_json();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut http = self.client.post(self.chat_completions_url()).json(&body);
        if let Some(key) = &self.api_key {
            http = http.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }

        let response = http.send().await.context("oracle request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("oracle returned {status}: {}", super::truncate(&text, 512)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("oracle response is not a chat completion")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("oracle response has no content"))
    }
}
