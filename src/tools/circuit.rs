use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CircuitRequest {
    /// Backend (provider id) name. Omit to list every breaker.
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResetCircuitRequest {
    /// Backend (provider id) whose breaker is forced back to closed.
    pub name: String,
}
