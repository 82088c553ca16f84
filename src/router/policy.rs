use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::router::classify::TaskCategory;

/// Provider selection policy.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Best available quality regardless of cost.
    High,
    #[default]
    Balanced,
    /// Cheapest capable provider first.
    Cost,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Balanced => "balanced",
            Self::Cost => "cost",
        }
    }
}

/// (policy, category) → ordered provider preference list.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: HashMap<(Policy, TaskCategory), Vec<String>>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        use TaskCategory::*;

        let mut table = Self::empty();
        for category in TaskCategory::ALL {
            let high: &[&str] = match category {
                Code => &["anthropic", "deepseek"],
                _ => &["anthropic"],
            };
            let balanced: &[&str] = match category {
                Hypothesis | Literature | Methodology | Analysis => &["anthropic", "deepseek"],
                Structure | Style | Code | General => &["deepseek", "anthropic"],
            };
            let cost: &[&str] = match category {
                Hypothesis | Methodology => &["deepseek", "anthropic"],
                _ => &["ollama", "deepseek", "anthropic"],
            };
            table.set(Policy::High, category, high);
            table.set(Policy::Balanced, category, balanced);
            table.set(Policy::Cost, category, cost);
        }
        table
    }
}

impl PolicyTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn set(&mut self, policy: Policy, category: TaskCategory, providers: &[&str]) {
        self.entries.insert(
            (policy, category),
            providers.iter().map(|p| p.to_string()).collect(),
        );
    }

    pub fn preferences(&self, policy: Policy, category: TaskCategory) -> &[String] {
        self.entries
            .get(&(policy, category))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Pick a provider id.
    ///
    /// `force` wins unconditionally. Otherwise the first preference that is
    /// the primary or reported available by `is_available` is returned; with
    /// no match the primary is returned.
    pub fn route(
        &self,
        category: TaskCategory,
        policy: Policy,
        force: Option<&str>,
        primary: &str,
        is_available: impl Fn(&str) -> bool,
    ) -> String {
        if let Some(forced) = force {
            return forced.to_string();
        }

        self.preferences(policy, category)
            .iter()
            .find(|id| id.as_str() == primary || is_available(id))
            .cloned()
            .unwrap_or_else(|| primary.to_string())
    }
}
