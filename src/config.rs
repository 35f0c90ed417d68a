//! Configuration for impersonation provisioning
//!
//! A single value built once by the binary and handed to every component at
//! construction. Nothing here is read from process-wide state.

use crate::retry::RetryConfig;
use crate::{IMPERSONATION_NAMESPACE, IMPERSONATION_PREFIX};

/// Groups every impersonated identity belongs to, regardless of its grants
pub const DEFAULT_BASELINE_GROUPS: &[&str] = &["system:authenticated", "system:cattle:authenticated"];

/// How a principal set is removed from the downstream cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TeardownPolicy {
    /// Delete the ClusterRole and let garbage collection remove its dependents
    #[default]
    OwnerCascade,
    /// Delete binding, ServiceAccount and ClusterRole explicitly, in that order
    Explicit,
}

/// Configuration shared by the reconciler and the lifecycle manager
#[derive(Clone, Debug)]
pub struct ImpersonationConfig {
    /// Namespace holding the impersonation ServiceAccounts
    pub namespace: String,
    /// Prefix for object names; the user uid is appended
    pub name_prefix: String,
    /// Groups always present on a resolved identity
    pub baseline_groups: Vec<String>,
    /// Backoff used while waiting for the token secret
    pub readiness: RetryConfig,
    /// Teardown strategy
    pub teardown: TeardownPolicy,
}

impl Default for ImpersonationConfig {
    fn default() -> Self {
        Self {
            namespace: IMPERSONATION_NAMESPACE.to_string(),
            name_prefix: IMPERSONATION_PREFIX.to_string(),
            baseline_groups: DEFAULT_BASELINE_GROUPS
                .iter()
                .map(|g| g.to_string())
                .collect(),
            readiness: RetryConfig::default(),
            teardown: TeardownPolicy::default(),
        }
    }
}

impl ImpersonationConfig {
    /// Name shared by the ClusterRole, ServiceAccount and binding for a user
    pub fn principal_name(&self, uid: &str) -> String {
        format!("{}{}", self.name_prefix, uid)
    }

    /// Override the readiness backoff
    pub fn with_readiness(mut self, readiness: RetryConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// Override the teardown policy
    pub fn with_teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_match_wire_contract() {
        let config = ImpersonationConfig::default();
        assert_eq!(config.namespace, "cattle-impersonation-system");
        assert_eq!(config.principal_name("u-abc12"), "cattle-impersonation-u-abc12");
        assert_eq!(
            config.baseline_groups,
            vec!["system:authenticated", "system:cattle:authenticated"]
        );
        assert_eq!(config.teardown, TeardownPolicy::OwnerCascade);
    }

    #[test]
    fn default_readiness_is_ten_polls_200ms_apart() {
        let readiness = ImpersonationConfig::default().readiness;
        assert_eq!(readiness.max_attempts, 10);
        assert_eq!(readiness.initial_delay, Duration::from_millis(200));
        assert_eq!(readiness.backoff_multiplier, 1.0);
    }

    #[test]
    fn builders_override_fields() {
        let config = ImpersonationConfig::default()
            .with_readiness(RetryConfig::with_max_attempts(3))
            .with_teardown(TeardownPolicy::Explicit);
        assert_eq!(config.readiness.max_attempts, 3);
        assert_eq!(config.teardown, TeardownPolicy::Explicit);
    }
}
