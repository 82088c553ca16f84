use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use crate::breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::cache::{CacheStats, CachedResponse, ResponseCache};
use crate::chunking::{self, ChunkRunOptions, MergeStrategy, ProgressSink};
use crate::config::{ChunkConfig, Config, ProviderRole};
use crate::dispatch::registry::ProviderRegistry;
use crate::dispatch::{ProviderRequest, Usage};
use crate::error::DispatchError;
use crate::events::{DispatchEvent, EventBus};
use crate::queue::{
    AdmissionQueue, Priority, QueueSnapshot, RequestId, RequestSnapshot, RequestStatus,
};
use crate::router::{Policy, PolicyTable, TaskCategory, classify};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Per-call options. Every recognised option is a field; there is no free-form bag.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Queue priority; None → configured default.
    pub priority: Option<Priority>,
    /// Skip routing and use this provider id.
    pub force_provider: Option<String>,
    /// Skip both cache read and cache write.
    pub bypass_cache: bool,
    /// Override the configured routing policy.
    pub policy: Option<Policy>,
    /// Override the configured merge strategy for chunked input.
    pub merge_strategy: Option<MergeStrategy>,
    /// Split oversized payloads; false sends them in one call.
    pub chunking: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            priority: None,
            force_provider: None,
            bypass_cache: false,
            policy: None,
            merge_strategy: None,
            chunking: true,
        }
    }
}

/// A unit of work submitted to the dispatcher.
#[derive(Debug, Clone)]
pub struct Task {
    /// Free-form description, used for classification.
    pub description: String,
    /// Prompt text sent to the provider.
    pub payload: String,
    /// Explicit category; None → classified from `description`.
    pub category: Option<TaskCategory>,
    pub options: RequestOptions,
}

impl Task {
    pub fn new(description: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            payload: payload.into(),
            category: None,
            options: RequestOptions::default(),
        }
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn category(&self) -> TaskCategory {
        self.category
            .unwrap_or_else(|| classify(&self.description))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub content: String,
    pub usage: Usage,
    /// Provider that produced the content; comma-separated when chunks differ.
    pub provider: String,
    pub category: TaskCategory,
    /// True when every part came from the response cache.
    pub cached: bool,
    /// Number of chunks the input was split into (1 = single shot).
    pub chunks: usize,
}

/// Handle to a queued request. Resolves exactly once.
pub struct RequestHandle {
    pub id: RequestId,
    rx: oneshot::Receiver<Result<DispatchResult, DispatchError>>,
}

impl RequestHandle {
    pub async fn wait(self) -> Result<DispatchResult, DispatchError> {
        self.rx
            .await
            .map_err(|_| DispatchError::Other(format!("request {} was dropped", self.id)))?
    }
}

type Waiter = oneshot::Sender<Result<DispatchResult, DispatchError>>;

/// Composition root: routing, cache, circuit breaking, chunking, admission.
///
/// All state lives on this instance; share it as `Arc<Dispatcher>`.
pub struct Dispatcher {
    registry: ProviderRegistry,
    policies: PolicyTable,
    policy: Policy,
    cache: ResponseCache,
    breaker: CircuitBreaker,
    queue: AdmissionQueue<Task>,
    waiters: Mutex<HashMap<RequestId, Waiter>>,
    chunking: ChunkConfig,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(config: &Config, registry: ProviderRegistry) -> Self {
        Self {
            registry,
            policies: PolicyTable::default(),
            policy: config.router.policy,
            cache: ResponseCache::new(config.cache.ttl(), config.cache.capacity),
            breaker: CircuitBreaker::new(&config.breaker),
            queue: AdmissionQueue::new(&config.queue),
            waiters: Mutex::new(HashMap::new()),
            chunking: config.chunking.clone(),
            events: EventBus::new(),
        }
    }

    /// Build HTTP providers from `config.providers`.
    pub fn from_config(config: &Config) -> Result<Self, DispatchError> {
        config.validate()?;
        let registry =
            ProviderRegistry::from_configs(&config.providers, config.router.probe_window())?;
        Ok(Self::new(config, registry))
    }

    pub fn with_policy_table(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Routing
    // ---------------------------------------------------------------------

    /// Provider for `category` under the effective policy.
    ///
    /// Only secondaries ranked ahead of the primary are probed.
    pub async fn select_provider(&self, category: TaskCategory, options: &RequestOptions) -> String {
        let policy = options.policy.unwrap_or(self.policy);
        let primary = self.registry.primary();
        let ahead_of_primary: Vec<String> = self
            .policies
            .preferences(policy, category)
            .iter()
            .take_while(|id| id.as_str() != primary)
            .cloned()
            .collect();
        let up = self.registry.availability(&ahead_of_primary).await;

        self.policies.route(
            category,
            policy,
            options.force_provider.as_deref(),
            primary,
            |id| up.contains(id),
        )
    }

    /// Single-shot dispatch of the task payload.
    pub async fn route(&self, task: &Task) -> Result<DispatchResult, DispatchError> {
        self.route_prompt(task.category(), &task.payload, &task.options)
            .await
    }

    async fn route_prompt(
        &self,
        category: TaskCategory,
        prompt: &str,
        options: &RequestOptions,
    ) -> Result<DispatchResult, DispatchError> {
        let key = ResponseCache::key(
            category,
            options.system_prompt.as_deref(),
            prompt,
            options.temperature,
        );

        if !options.bypass_cache
            && let Some(hit) = self.cache.get(&key)
        {
            return Ok(DispatchResult {
                content: hit.content,
                usage: hit.usage,
                provider: hit.provider,
                category,
                cached: true,
                chunks: 1,
            });
        }

        let provider_id = self.select_provider(category, options).await;
        let provider = self.registry.provider(&provider_id)?;
        let req = ProviderRequest {
            prompt: prompt.to_string(),
            system_prompt: options.system_prompt.clone(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let primary_id = self.registry.primary();
        let forced = options.force_provider.is_some();
        tracing::debug!(
            category = category.as_str(),
            provider = provider_id,
            forced,
            "routing request"
        );

        let result = if provider_id == primary_id || forced {
            self.breaker
                .execute(&provider_id, || provider.invoke(&req))
                .await?
        } else {
            let primary = self.registry.provider(primary_id)?;
            self.breaker
                .execute_with_fallback(
                    &provider_id,
                    || provider.invoke(&req),
                    || self.breaker.execute(primary_id, || primary.invoke(&req)),
                )
                .await?
        };

        if !options.bypass_cache {
            self.cache.set(
                key,
                CachedResponse {
                    content: result.content.clone(),
                    usage: result.usage,
                    provider: result.provider.clone(),
                },
            );
        }

        Ok(DispatchResult {
            content: result.content,
            usage: result.usage,
            provider: result.provider,
            category,
            cached: false,
            chunks: 1,
        })
    }

    /// Dispatch, splitting the payload into sequential chunks when its
    /// estimated size exceeds the category's ceiling.
    ///
    /// Tasks with `options.chunking` off are sent in a single call.
    pub async fn route_with_chunking(&self, task: &Task) -> Result<DispatchResult, DispatchError> {
        self.route_chunked(task, None).await
    }

    async fn route_chunked(
        &self,
        task: &Task,
        id: Option<RequestId>,
    ) -> Result<DispatchResult, DispatchError> {
        let category = task.category();
        let estimated = chunking::estimate_tokens(&task.payload);
        if !task.options.chunking || estimated <= category.chunk_ceiling() {
            return self.route(task).await;
        }

        let chunks =
            chunking::split_into_chunks(&task.payload, self.chunking.max_tokens, self.chunking.overlap);
        let total = chunks.len();
        tracing::info!(
            request = id.map(|r| r.0),
            category = category.as_str(),
            estimated,
            chunks = total,
            "payload over ceiling, chunking"
        );

        let opts = ChunkRunOptions {
            max_retries: self.chunking.max_retries,
            delay: self.chunking.retry_delay(),
        };
        let options = &task.options;
        let progress = ProgressSink::new(&self.events, id);
        let parts = chunking::process_chunks(&chunks, opts, Some(progress), |chunk| {
            let prompt = format!("[Part {} of {total}]\n\n{}", chunk.index + 1, chunk.text);
            async move { self.route_prompt(category, &prompt, options).await }
        })
        .await?;

        let strategy = options.merge_strategy.unwrap_or(self.chunking.merge_strategy);
        let contents: Vec<String> = parts.iter().map(|p| p.content.clone()).collect();

        let mut usage = Usage::default();
        let mut providers: Vec<&str> = Vec::new();
        for part in &parts {
            usage.add(part.usage);
            if !providers.contains(&part.provider.as_str()) {
                providers.push(&part.provider);
            }
        }

        Ok(DispatchResult {
            content: chunking::merge_chunks(&contents, strategy),
            usage,
            provider: providers.join(","),
            category,
            cached: parts.iter().all(|p| p.cached),
            chunks: total,
        })
    }

    // ---------------------------------------------------------------------
    // Admission queue
    // ---------------------------------------------------------------------

    /// Admit a task; it runs through [`route_with_chunking`](Self::route_with_chunking)
    /// once a concurrency slot frees up.
    pub fn submit(self: &Arc<Self>, task: Task) -> Result<RequestHandle, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let priority = task.options.priority;
        let id = {
            // Held across enqueue so a fast completion always finds its waiter.
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            let id = self.queue.enqueue(task, priority)?;
            waiters.insert(id, tx);
            id
        };
        self.events.publish(DispatchEvent::Request {
            id,
            status: RequestStatus::Queued,
        });
        self.pump();
        Ok(RequestHandle { id, rx })
    }

    /// Start as many waiting requests as there are free slots.
    fn pump(self: &Arc<Self>) {
        while let Some(id) = self.queue.dequeue() {
            self.events.publish(DispatchEvent::Request {
                id,
                status: RequestStatus::Processing,
            });
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = this
                    .queue
                    .process_request(id, |task| {
                        let this = Arc::clone(&this);
                        async move {
                            AssertUnwindSafe(this.route_chunked(&task, Some(id)))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| {
                                    Err(DispatchError::Other(format!("request {id} panicked")))
                                })
                        }
                    })
                    .await;

                let status = if outcome.is_ok() {
                    RequestStatus::Completed
                } else {
                    RequestStatus::Failed
                };
                if let Err(ref e) = outcome {
                    tracing::warn!(%id, "request failed: {e}");
                }
                this.resolve(id, outcome);
                this.events.publish(DispatchEvent::Request { id, status });
                this.pump();
            });
        }
    }

    fn resolve(&self, id: RequestId, outcome: Result<DispatchResult, DispatchError>) {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(tx) = waiter {
            // Receiver dropped = caller stopped waiting; nothing to do.
            let _ = tx.send(outcome);
        }
    }

    pub fn status(&self, id: RequestId) -> Result<RequestSnapshot, DispatchError> {
        self.queue.status(id)
    }

    /// Cancel a request that has not started. Its handle resolves to `Cancelled`.
    pub fn cancel(&self, id: RequestId) -> Result<(), DispatchError> {
        self.queue.cancel(id)?;
        self.resolve(id, Err(DispatchError::Cancelled(id)));
        self.events.publish(DispatchEvent::Request {
            id,
            status: RequestStatus::Cancelled,
        });
        Ok(())
    }

    pub fn prioritize(&self, id: RequestId, priority: Priority) -> Result<(), DispatchError> {
        self.queue.prioritize(id, priority)
    }

    pub fn estimate_wait(&self, id: RequestId) -> Result<Duration, DispatchError> {
        self.queue.estimate_wait(id)
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    // ---------------------------------------------------------------------
    // Circuit breaker / cache surface
    // ---------------------------------------------------------------------

    pub fn circuit_state(&self, name: &str) -> CircuitState {
        self.breaker.state(name)
    }

    pub fn circuit_snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        self.breaker.snapshot(name)
    }

    pub fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        self.breaker.all_states()
    }

    pub fn reset_circuit(&self, name: &str) -> bool {
        self.breaker.reset(name)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Provider ids with role and live availability, sorted by id.
    pub async fn providers(&self) -> Vec<(String, ProviderRole, bool)> {
        let mut out = Vec::new();
        for (id, role) in self.registry.list() {
            let up = self.registry.is_available(id).await;
            out.push((id.to_string(), role, up));
        }
        out
    }
}
