use std::time::Duration;

use serde::Deserialize;

fn default_enabled() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    // Invalidation is event-driven; the TTL is only a backstop.
    3 * 24 * 60 * 60
}

/// Authorization settings, deserializable from the embedding application's
/// layered configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthzSettings {
    /// Deployment-time bypass: when false, every permission check passes.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for AuthzSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl AuthzSettings {
    /// Settings with enforcement switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
