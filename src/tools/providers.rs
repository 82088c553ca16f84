use serde::Serialize;

use crate::breaker::CircuitState;
use crate::config::ProviderRole;

#[derive(Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub role: &'static str,
    pub available: bool,
    pub circuit: CircuitState,
}

impl ProviderInfo {
    pub fn new(id: String, role: ProviderRole, available: bool, circuit: CircuitState) -> Self {
        Self {
            id,
            role: match role {
                ProviderRole::Primary => "primary",
                ProviderRole::Secondary => "secondary",
            },
            available,
            circuit,
        }
    }
}

#[derive(Serialize)]
pub struct ListProvidersResponse {
    pub providers: Vec<ProviderInfo>,
}

impl ListProvidersResponse {
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("| provider | role | available | circuit |\n|---|---|---|---|\n");
        for p in &self.providers {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                p.id,
                p.role,
                if p.available { "yes" } else { "no" },
                p.circuit.as_str()
            ));
        }
        out
    }
}
