use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use conductor_types::{ActionType, Platform};

use crate::client::PlatformClient;
use crate::mapping::FieldMappings;

/// Closed registry of platform adapters, keyed by the platform tag. One
/// implementation per platform; re-registering replaces the previous one.
#[derive(Clone)]
pub struct PlatformRegistry {
    clients: Arc<RwLock<HashMap<Platform, Arc<dyn PlatformClient>>>>,
    mappings: Arc<FieldMappings>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::with_mappings(FieldMappings::with_default_rules())
    }

    pub fn with_mappings(mappings: FieldMappings) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            mappings: Arc::new(mappings),
        }
    }

    pub async fn register(&self, client: Arc<dyn PlatformClient>) {
        self.clients.write().await.insert(client.platform(), client);
    }

    pub async fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformClient>> {
        self.clients.read().await.get(&platform).cloned()
    }

    pub async fn registered(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.clients.read().await.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }

    /// Redaction masks declared by the adapter for `platform`, empty when
    /// the platform is unregistered.
    pub async fn redaction_masks(&self, platform: Platform) -> Vec<String> {
        match self.clients.read().await.get(&platform) {
            Some(client) => client.redaction_masks(),
            None => Vec::new(),
        }
    }

    /// Per-type fallback parameter translation (spec'd at the registry so
    /// decisions stay platform-agnostic).
    pub fn map_params(
        &self,
        action_type: ActionType,
        from: Platform,
        to: Platform,
        params: &serde_json::Value,
    ) -> serde_json::Value {
        self.mappings.map_params(action_type, from, to, params)
    }

    /// Probe every registered adapter; returns `(platform, healthy)` pairs.
    pub async fn health_check_all(&self) -> Vec<(Platform, bool)> {
        let clients: Vec<Arc<dyn PlatformClient>> =
            self.clients.read().await.values().cloned().collect();
        let mut results = Vec::with_capacity(clients.len());
        for client in clients {
            let healthy = client.health_check().await.is_ok();
            results.push((client.platform(), healthy));
        }
        results.sort_by_key(|(p, _)| p.as_str());
        results
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPlatformClient;

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = PlatformRegistry::new();
        registry
            .register(Arc::new(MemoryPlatformClient::new(Platform::Notion)))
            .await;
        assert!(registry.get(Platform::Notion).await.is_some());
        assert!(registry.get(Platform::Trello).await.is_none());
        assert_eq!(registry.registered().await, vec![Platform::Notion]);
    }

    #[tokio::test]
    async fn health_check_reports_per_platform() {
        let registry = PlatformRegistry::new();
        let healthy = MemoryPlatformClient::new(Platform::Slack);
        let sick = MemoryPlatformClient::new(Platform::Drive);
        sick.set_healthy(false);
        registry.register(Arc::new(healthy)).await;
        registry.register(Arc::new(sick)).await;

        let report = registry.health_check_all().await;
        assert_eq!(report, vec![(Platform::Drive, false), (Platform::Slack, true)]);
    }
}
