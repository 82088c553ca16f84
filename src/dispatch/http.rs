use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;

use crate::dispatch::{Provider, ProviderRequest, ProviderResult, Usage};
use crate::error::DispatchError;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Upper bound on a single backend call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Availability probes must answer quickly or count as unavailable.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Wire format spoken by an HTTP backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    /// OpenAI-compatible chat completions (DeepSeek, Ollama, most gateways).
    #[default]
    OpenAi,
    /// Anthropic Messages API (different headers, `system` as a top-level field).
    Anthropic,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicMessage {
    content: Vec<AnthropicBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// A provider reached over HTTP.
pub struct HttpProvider {
    id: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    api_format: ApiFormat,
    probe_url: Option<String>,
    client: Client,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_format", &self.api_format)
            .field("probe_url", &self.probe_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpProvider {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        api_format: ApiFormat,
        probe_url: Option<String>,
    ) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            id: id.into(),
            model: model.into(),
            base_url: base_url.into(),
            api_key,
            api_format,
            probe_url,
            client,
        })
    }

    /// Build the JSON request body for this provider's wire format.
    pub fn build_body(&self, req: &ProviderRequest) -> serde_json::Value {
        match self.api_format {
            ApiFormat::OpenAi => {
                let mut messages = Vec::new();
                if let Some(ref system) = req.system_prompt {
                    messages.push(serde_json::json!({"role": "system", "content": system}));
                }
                messages.push(serde_json::json!({"role": "user", "content": req.prompt}));
                serde_json::json!({
                    "model": self.model,
                    "messages": messages,
                    "temperature": req.temperature,
                    "max_tokens": req.max_tokens,
                })
            }
            ApiFormat::Anthropic => {
                let mut body = serde_json::json!({
                    "model": self.model,
                    "messages": [{"role": "user", "content": req.prompt}],
                    "temperature": req.temperature,
                    "max_tokens": req.max_tokens,
                });
                if let Some(ref system) = req.system_prompt {
                    body["system"] = serde_json::Value::String(system.clone());
                }
                body
            }
        }
    }

    /// Parse a successful response body into text + usage.
    pub fn parse_body(&self, bytes: &[u8]) -> Result<(String, Usage), DispatchError> {
        match self.api_format {
            ApiFormat::OpenAi => {
                let completion: ChatCompletion = serde_json::from_slice(bytes).map_err(|e| {
                    DispatchError::SchemaParse(format!("failed to parse response: {e}"))
                })?;
                let usage = completion
                    .usage
                    .map(|u| Usage {
                        input_tokens: u.prompt_tokens,
                        output_tokens: u.completion_tokens,
                    })
                    .unwrap_or_default();
                let text = completion
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| DispatchError::ProviderInvocation {
                        provider: self.id.clone(),
                        message: "empty choices or null content".to_string(),
                        status: None,
                    })?;
                Ok((text, usage))
            }
            ApiFormat::Anthropic => {
                let message: AnthropicMessage = serde_json::from_slice(bytes).map_err(|e| {
                    DispatchError::SchemaParse(format!("failed to parse response: {e}"))
                })?;
                let usage = message
                    .usage
                    .map(|u| Usage {
                        input_tokens: u.input_tokens,
                        output_tokens: u.output_tokens,
                    })
                    .unwrap_or_default();
                let text: String = message
                    .content
                    .into_iter()
                    .filter(|b| b.kind == "text")
                    .filter_map(|b| b.text)
                    .collect();
                if text.is_empty() {
                    return Err(DispatchError::ProviderInvocation {
                        provider: self.id.clone(),
                        message: "no text blocks in response".to_string(),
                        status: None,
                    });
                }
                Ok((text, usage))
            }
        }
    }

    async fn query(&self, req: &ProviderRequest) -> Result<ProviderResult, DispatchError> {
        let start = Instant::now();
        let body = self.build_body(req);

        let mut request = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .json(&body);

        request = match (self.api_format, self.api_key.as_deref()) {
            (ApiFormat::OpenAi, Some(key)) => request.header("Authorization", format!("Bearer {key}")),
            (ApiFormat::Anthropic, Some(key)) => request
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            (_, None) => request,
        };

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DispatchError::RateLimited {
                provider: self.id.clone(),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(DispatchError::AuthFailed {
                provider: self.id.clone(),
                message: format!("{status}"),
            });
        }

        // Cap error body reads to MAX_RESPONSE_BYTES to prevent memory exhaustion
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            let text = String::from_utf8_lossy(truncated);
            return Err(DispatchError::ProviderInvocation {
                provider: self.id.clone(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        if let Some(len) = response.content_length()
            && len as usize > MAX_RESPONSE_BYTES
        {
            return Err(DispatchError::ProviderInvocation {
                provider: self.id.clone(),
                message: format!("response too large: {len} bytes (max {MAX_RESPONSE_BYTES})"),
                status: None,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DispatchError::ProviderInvocation {
                provider: self.id.clone(),
                message: format!("failed to read response body: {e}"),
                status: None,
            })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(DispatchError::ProviderInvocation {
                provider: self.id.clone(),
                message: format!(
                    "response too large: {} bytes (max {})",
                    bytes.len(),
                    MAX_RESPONSE_BYTES
                ),
                status: None,
            });
        }

        let (content, usage) = self.parse_body(&bytes)?;

        tracing::debug!(
            provider = self.id,
            model = self.model,
            latency_ms = start.elapsed().as_millis() as u64,
            output_tokens = usage.output_tokens,
            "provider call completed"
        );

        Ok(ProviderResult {
            content,
            usage,
            provider: self.id.clone(),
        })
    }

    async fn probe(&self) -> bool {
        let Some(ref url) = self.probe_url else {
            // No probe endpoint configured: availability follows credentials.
            return self.api_key.is_some();
        };
        match self.client.get(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(provider = self.id, "availability probe failed: {e}");
                false
            }
        }
    }
}

impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke<'a>(
        &'a self,
        req: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResult, DispatchError>> {
        self.query(req).boxed()
    }

    fn probe_availability(&self) -> BoxFuture<'_, bool> {
        self.probe().boxed()
    }
}
