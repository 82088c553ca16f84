use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{ProviderConfig, ProviderRole};
use crate::dispatch::Provider;
use crate::dispatch::http::HttpProvider;
use crate::error::DispatchError;

pub struct ProviderEntry {
    pub role: ProviderRole,
    pub provider: Arc<dyn Provider>,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.provider.id())
            .field("role", &self.role)
            .finish()
    }
}

/// Provider profiles plus a short-lived cache of secondary probe results.
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderEntry>,
    primary: String,
    probe_window: Duration,
    probes: Mutex<HashMap<String, (Instant, bool)>>,
}

impl ProviderRegistry {
    /// Build a registry; exactly one entry must be `Primary`.
    pub fn new(
        entries: Vec<(ProviderRole, Arc<dyn Provider>)>,
        probe_window: Duration,
    ) -> Result<Self, DispatchError> {
        let mut providers = HashMap::new();
        let mut primary = None;

        for (role, provider) in entries {
            let id = provider.id().to_string();
            if role == ProviderRole::Primary {
                if let Some(ref existing) = primary {
                    return Err(DispatchError::Config(format!(
                        "multiple primary providers: {existing}, {id}"
                    )));
                }
                primary = Some(id.clone());
            }
            if providers
                .insert(id.clone(), ProviderEntry { role, provider })
                .is_some()
            {
                return Err(DispatchError::Config(format!("duplicate provider id: {id}")));
            }
        }

        let primary =
            primary.ok_or_else(|| DispatchError::Config("no primary provider".to_string()))?;

        Ok(Self {
            providers,
            primary,
            probe_window,
            probes: Mutex::new(HashMap::new()),
        })
    }

    /// Build HTTP providers from configuration.
    pub fn from_configs(
        configs: &[ProviderConfig],
        probe_window: Duration,
    ) -> Result<Self, DispatchError> {
        let mut entries: Vec<(ProviderRole, Arc<dyn Provider>)> = Vec::new();
        for c in configs {
            let provider = HttpProvider::new(
                c.id.clone(),
                c.model.clone(),
                c.base_url.clone(),
                c.api_key.clone(),
                c.api_format,
                c.probe_url.clone(),
            )?;
            entries.push((c.role, Arc::new(provider)));
        }
        Self::new(entries, probe_window)
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn get(&self, id: &str) -> Option<&ProviderEntry> {
        self.providers.get(id)
    }

    pub fn provider(&self, id: &str) -> Result<Arc<dyn Provider>, DispatchError> {
        self.providers
            .get(id)
            .map(|e| e.provider.clone())
            .ok_or_else(|| DispatchError::UnknownProvider(id.to_string()))
    }

    pub fn list(&self) -> Vec<(&str, ProviderRole)> {
        let mut all: Vec<(&str, ProviderRole)> = self
            .providers
            .iter()
            .map(|(id, e)| (id.as_str(), e.role))
            .collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all
    }

    /// Primary is always available; secondaries use a cached probe.
    pub async fn is_available(&self, id: &str) -> bool {
        let Some(entry) = self.providers.get(id) else {
            return false;
        };
        if entry.role == ProviderRole::Primary {
            return true;
        }

        {
            let probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((probed_at, up)) = probes.get(id)
                && probed_at.elapsed() < self.probe_window
            {
                return *up;
            }
        }
        // Lock released before the probe I/O.

        let up = entry.provider.probe_availability().await;
        tracing::debug!(provider = id, available = up, "probed provider");

        let mut probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
        probes.insert(id.to_string(), (Instant::now(), up));
        up
    }

    /// Availability of every provider named in `candidates`.
    pub async fn availability(&self, candidates: &[String]) -> HashSet<String> {
        let mut up = HashSet::new();
        for id in candidates {
            if self.is_available(id).await {
                up.insert(id.clone());
            }
        }
        up
    }
}
