use thiserror::Error;

use crate::queue::RequestId;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue full: {size}/{max} requests waiting")]
    QueueFull { size: usize, max: usize },

    #[error("request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("request {0} is no longer queued")]
    NotQueued(RequestId),

    #[error("circuit open for {name}")]
    CircuitOpen { name: String },

    #[error("circuit {name}: primary and fallback failed: {primary}; fallback: {fallback}")]
    CircuitBreaker {
        name: String,
        primary: Box<DispatchError>,
        fallback: Box<DispatchError>,
    },

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkProcessing {
        index: usize,
        attempts: u32,
        #[source]
        source: Box<DispatchError>,
    },

    #[error("provider {provider} failed: {message}")]
    ProviderInvocation {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("request {0} cancelled")]
    Cancelled(RequestId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl DispatchError {
    /// Extract provider (or breaker) name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { name } => Some(name),
            Self::CircuitBreaker { name, .. } => Some(name),
            Self::ProviderInvocation { provider, .. } => Some(provider),
            Self::RateLimited { provider } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::UnknownProvider(provider) => Some(provider),
            Self::ChunkProcessing { source, .. } => source.provider(),
            _ => None,
        }
    }

    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            Self::ProviderInvocation { status, .. } => {
                // status: None = ambiguous (not from HTTP) → NOT retryable
                status.is_some_and(|s| s >= 500)
            }
            Self::Request(_) => true,
            Self::CircuitOpen { .. } => true, // breaker may half-open later
            _ => false,
        }
    }

    /// Produce a sanitized message safe for returning to callers.
    /// Does not leak internal URLs, connection details, or upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::QueueFull { max, .. } => {
                format!("request queue is full ({max} waiting), try again later")
            }
            Self::RequestNotFound(id) => format!("request not found: {id}"),
            Self::NotQueued(id) => format!("request {id} is no longer queued"),
            Self::CircuitOpen { name } => {
                format!("provider {name} is temporarily unavailable")
            }
            Self::CircuitBreaker { name, .. } => {
                format!("provider {name} and its fallback both failed")
            }
            Self::ChunkProcessing {
                index,
                attempts,
                source,
            } => format!(
                "chunk {index} failed after {attempts} attempts: {}",
                source.user_message()
            ),
            Self::ProviderInvocation {
                provider, status, ..
            } => match status {
                Some(s) => format!("provider {provider} returned HTTP {s}"),
                None => format!("provider {provider} returned an unusable response"),
            },
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::AuthFailed { provider, .. } => format!("authentication failed for {provider}"),
            Self::UnknownProvider(p) => format!("unknown provider: {p}"),
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled(id) => format!("request {id} was cancelled"),
            Self::Config(msg) => format!("invalid configuration: {msg}"),
            Self::Other(msg) => msg.clone(),
        }
    }

    /// Short machine-readable reason, used in request snapshots.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::RequestNotFound(_) => "not_found",
            Self::NotQueued(_) => "not_queued",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::CircuitBreaker { .. } => "circuit_fallback_failed",
            Self::ChunkProcessing { .. } => "chunk_failed",
            Self::ProviderInvocation { .. } => "provider_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthFailed { .. } => "auth_failed",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::SchemaParse(_) => "parse_error",
            Self::Request(_) => "request_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Other(_) => "error",
        }
    }
}
