use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{PolicyConfig, PolicyDomain, SystemPolicyOverrides, UserPolicyOverrides};

/// Supplies the policy a request runs under.
///
/// Implementations never fail: unknown tenants fall back to defaults.
#[async_trait]
pub trait PolicyConfigProvider: Send + Sync {
    async fn get_policy(&self, tenant_id: &str, domain: PolicyDomain) -> PolicyConfig;
}

#[derive(Debug, Clone, Default)]
struct StoredOverrides {
    system: SystemPolicyOverrides,
    user: UserPolicyOverrides,
}

/// Process-local provider backed by a concurrent map.
#[derive(Debug, Clone)]
pub struct InMemoryPolicyProvider {
    defaults: Arc<PolicyConfig>,
    overrides: Arc<DashMap<(String, PolicyDomain), StoredOverrides>>,
}

impl InMemoryPolicyProvider {
    pub fn new(defaults: PolicyConfig) -> Self {
        Self {
            defaults: Arc::new(defaults),
            overrides: Arc::new(DashMap::new()),
        }
    }

    pub fn defaults(&self) -> &PolicyConfig {
        &self.defaults
    }

    pub fn set_system_overrides(
        &self,
        tenant_id: &str,
        domain: PolicyDomain,
        system: SystemPolicyOverrides,
    ) {
        self.overrides
            .entry((tenant_id.to_string(), domain))
            .or_default()
            .system = system;
    }

    pub fn set_user_overrides(&self, tenant_id: &str, domain: PolicyDomain, user: UserPolicyOverrides) {
        self.overrides
            .entry((tenant_id.to_string(), domain))
            .or_default()
            .user = user;
    }

    pub fn clear(&self, tenant_id: &str, domain: PolicyDomain) {
        self.overrides.remove(&(tenant_id.to_string(), domain));
    }
}

impl Default for InMemoryPolicyProvider {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

#[async_trait]
impl PolicyConfigProvider for InMemoryPolicyProvider {
    async fn get_policy(&self, tenant_id: &str, domain: PolicyDomain) -> PolicyConfig {
        match self.overrides.get(&(tenant_id.to_string(), domain)) {
            Some(stored) => {
                debug!(tenant_id, %domain, "resolving policy with overrides");
                self.defaults.resolve(&stored.system, &stored.user)
            }
            None => (*self.defaults).clone(),
        }
    }
}
