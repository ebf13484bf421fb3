use std::collections::BTreeMap;

use serde::Serialize;

use crate::dispatch::registry::{ProviderEntry, ProviderRegistry, ProviderStatus};

#[derive(Debug, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub model: String,
    pub enabled: bool,
}

impl From<&ProviderEntry> for ProviderInfo {
    fn from(entry: &ProviderEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            model: entry.model_id.clone(),
            enabled: entry.enabled,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListProvidersResponse {
    pub providers: Vec<ProviderInfo>,
    pub default: Option<String>,
    pub status: BTreeMap<String, ProviderStatus>,
}

impl ListProvidersResponse {
    pub fn from_registry(registry: &ProviderRegistry) -> Self {
        Self {
            providers: registry.providers().iter().map(ProviderInfo::from).collect(),
            default: registry.default_provider().ok().map(str::to_string),
            status: registry.provider_status(),
        }
    }
}
