pub mod http;
pub mod registry;

use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::error::DispatchError;

/// Internal request type accepted by every provider.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub prompt: String,
    /// System prompt to set model behavior (HTTP: separate message or `system` field).
    pub system_prompt: Option<String>,
    /// Sampling temperature (0 = deterministic, 1 = creative).
    pub temperature: f64,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

/// Token accounting reported by the backend, when it reports any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Internal result type returned by every provider.
#[derive(Clone, Debug)]
pub struct ProviderResult {
    pub content: String,
    pub usage: Usage,
    pub provider: String,
}

/// An interchangeable text-generation backend.
///
/// Futures are boxed so registries can hold `Arc<dyn Provider>`.
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn invoke<'a>(
        &'a self,
        req: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResult, DispatchError>>;

    /// Live availability check. Only consulted for secondary providers.
    fn probe_availability(&self) -> BoxFuture<'_, bool>;
}
