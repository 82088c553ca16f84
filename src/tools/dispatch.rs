use schemars::JsonSchema;
use serde::Deserialize;

use crate::chunking::MergeStrategy;
use crate::dispatcher::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, RequestOptions, Task};
use crate::router::{Policy, TaskCategory};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DispatchRequest {
    /// Short description of the task (e.g. "tighten the methodology section"). Drives classification.
    pub description: String,
    /// The prompt text sent to the provider. Long text is split into chunks automatically.
    pub prompt: String,
    /// Explicit task category; classified from `description` when omitted.
    pub category: Option<TaskCategory>,
    /// System prompt to set model persona/behavior.
    pub system_prompt: Option<String>,
    /// Sampling temperature: 0.0 = deterministic, 1.0 = creative (default 0.7).
    pub temperature: Option<f64>,
    /// Maximum tokens to generate (default 4096).
    pub max_tokens: Option<u32>,
    /// Provider id to use regardless of policy (see `list_providers`).
    pub force_provider: Option<String>,
    /// Skip the response cache for this call.
    pub bypass_cache: Option<bool>,
    /// Routing policy: "high", "balanced" or "cost" (defaults to the server setting).
    pub policy: Option<Policy>,
    /// How chunk results are joined: "sequential", "preserve" or "smart".
    pub merge_strategy: Option<MergeStrategy>,
    /// Set false to send oversized prompts in a single call (default true).
    pub chunking: Option<bool>,
}

impl DispatchRequest {
    pub fn chunking_enabled(&self) -> bool {
        self.chunking.unwrap_or(true)
    }

    pub fn to_task(&self) -> Task {
        Task {
            description: self.description.clone(),
            payload: self.prompt.clone(),
            category: self.category,
            options: RequestOptions {
                system_prompt: self.system_prompt.clone(),
                temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                priority: None,
                force_provider: self
                    .force_provider
                    .clone()
                    .filter(|p| !p.trim().is_empty()),
                bypass_cache: self.bypass_cache.unwrap_or(false),
                policy: self.policy,
                merge_strategy: self.merge_strategy,
                chunking: self.chunking_enabled(),
            },
        }
    }
}
