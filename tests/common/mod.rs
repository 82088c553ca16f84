//! Scripted providers and configs shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use plume::config::{Config, ProviderRole};
use plume::dispatch::registry::ProviderRegistry;
use plume::dispatch::{Provider, ProviderRequest, ProviderResult, Usage};
use plume::dispatcher::Dispatcher;
use plume::error::DispatchError;

/// Provider that answers `"{id}: {prompt}"` after an optional delay, or fails
/// while it still has scripted failures left. A panicking provider panics
/// on every call.
pub struct ScriptedProvider {
    id: String,
    failures_left: AtomicUsize,
    available: AtomicBool,
    panics: bool,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            failures_left: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            panics: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(id: &str) -> Self {
        Self::new(id).fail_times(usize::MAX)
    }

    pub fn fail_times(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    async fn answer(&self, req: &ProviderRequest) -> Result<ProviderResult, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(req.prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics {
            panic!("{} blew up", self.id);
        }

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            if left != usize::MAX {
                self.failures_left.store(left - 1, Ordering::SeqCst);
            }
            return Err(DispatchError::ProviderInvocation {
                provider: self.id.clone(),
                message: "scripted failure".to_string(),
                status: Some(503),
            });
        }

        Ok(ProviderResult {
            content: format!("{}: {}", self.id, req.prompt),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            provider: self.id.clone(),
        })
    }
}

impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke<'a>(
        &'a self,
        req: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResult, DispatchError>> {
        self.answer(req).boxed()
    }

    fn probe_availability(&self) -> BoxFuture<'_, bool> {
        let up = self.available.load(Ordering::SeqCst);
        async move { up }.boxed()
    }
}

/// The default provider trio, scripted.
pub struct Trio {
    pub anthropic: Arc<ScriptedProvider>,
    pub deepseek: Arc<ScriptedProvider>,
    pub ollama: Arc<ScriptedProvider>,
}

impl Trio {
    pub fn new(
        anthropic: ScriptedProvider,
        deepseek: ScriptedProvider,
        ollama: ScriptedProvider,
    ) -> Self {
        Self {
            anthropic: Arc::new(anthropic),
            deepseek: Arc::new(deepseek),
            ollama: Arc::new(ollama),
        }
    }

    pub fn healthy() -> Self {
        Self::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("deepseek"),
            ScriptedProvider::new("ollama"),
        )
    }

    pub fn registry(&self) -> ProviderRegistry {
        let entries: Vec<(ProviderRole, Arc<dyn Provider>)> = vec![
            (ProviderRole::Primary, self.anthropic.clone() as Arc<dyn Provider>),
            (ProviderRole::Secondary, self.deepseek.clone() as Arc<dyn Provider>),
            (ProviderRole::Secondary, self.ollama.clone() as Arc<dyn Provider>),
        ];
        ProviderRegistry::new(entries, Duration::from_secs(60)).unwrap()
    }

    pub fn dispatcher(&self, config: &Config) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(config, self.registry()))
    }
}

/// Defaults with fast chunk pacing.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.chunking.retry_delay_ms = 10;
    config
}

/// Sentences of roughly nine estimated tokens each.
pub fn sentences(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("Sentence number {i} has some words."))
        .collect()
}
