use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Coarse task classification driving provider choice and chunk ceilings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Hypothesis,
    Structure,
    Literature,
    Methodology,
    Analysis,
    Code,
    Style,
    General,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 8] = [
        Self::Hypothesis,
        Self::Structure,
        Self::Literature,
        Self::Methodology,
        Self::Analysis,
        Self::Code,
        Self::Style,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hypothesis => "hypothesis",
            Self::Structure => "structure",
            Self::Literature => "literature",
            Self::Methodology => "methodology",
            Self::Analysis => "analysis",
            Self::Code => "code",
            Self::Style => "style",
            Self::General => "general",
        }
    }

    /// Estimated-token ceiling above which input is split into chunks.
    pub fn chunk_ceiling(&self) -> usize {
        match self {
            Self::Literature => 12_000,
            Self::Structure | Self::Analysis => 10_000,
            Self::Hypothesis | Self::Methodology | Self::Style => 8_000,
            Self::Code | Self::General => 6_000,
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered (keywords, category) rules. Evaluated top to bottom, first hit wins.
///
/// Overlapping descriptions resolve by position only: "outline the code
/// chapter" is `Structure` because that row precedes `Code`. Do not reorder.
const RULES: &[(&[&str], TaskCategory)] = &[
    (
        &["hypothes", "research question", "conjecture", "premise"],
        TaskCategory::Hypothesis,
    ),
    (
        &["structure", "outline", "organiz", "organis", "chapter", "section"],
        TaskCategory::Structure,
    ),
    (
        &["literature", "citation", "reference", "bibliograph", "sources"],
        TaskCategory::Literature,
    ),
    (
        &["methodolog", "method", "experiment", "study design", "sampling"],
        TaskCategory::Methodology,
    ),
    (
        &["analy", "statistic", "dataset", "results", "interpret"],
        TaskCategory::Analysis,
    ),
    (
        &["code", "program", "script", "function", "debug"],
        TaskCategory::Code,
    ),
    (
        &["style", "tone", "grammar", "rewrite", "polish", "clarity"],
        TaskCategory::Style,
    ),
];

/// Classify a free-form task description. No match → `General`.
pub fn classify(description: &str) -> TaskCategory {
    let lowered = description.to_lowercase();
    RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(_, category)| *category)
        .unwrap_or(TaskCategory::General)
}
