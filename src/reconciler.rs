//! Impersonation resource reconciler
//!
//! Ensures the four downstream objects behind an impersonation principal:
//! the shared namespace, a ClusterRole holding the impersonation rules, a
//! ServiceAccount owned by that role, and a ClusterRoleBinding linking the
//! two. Then waits for the token controller to attach a credential secret.
//!
//! Every step is create-or-adopt, so a failed call is simply re-run from the
//! top on the next grant event. There is no per-user lock: two concurrent
//! calls for the same user both converge because creation races resolve to
//! the object the winner wrote.
//!
//! ```text
//! probe role ─┬─ rules equal ──▶ read ServiceAccount ──▶ done
//!             ├─ rules differ ─▶ update role ─┐
//!             └─ absent ──────────────────────┤
//!                                             ▼
//!       namespace ▶ role ▶ ServiceAccount ▶ binding ▶ wait for token
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, instrument, trace};

use crate::config::ImpersonationConfig;
use crate::identity::Identity;
use crate::remote::{Read, RemoteClient};
use crate::retry::poll_with_backoff;
use crate::rules::rules_for_identity;
use crate::{Error, IMPERSONATION_LABEL, TOKEN_KEY};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const RBAC_API_VERSION: &str = "rbac.authorization.k8s.io/v1";

fn impersonation_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(IMPERSONATION_LABEL.to_string(), "true".to_string())])
}

/// Owner reference making `role` the cascade anchor for a dependent
fn owned_by(role: &ClusterRole) -> Result<OwnerReference, Error> {
    let name = role.metadata.name.clone().unwrap_or_default();
    let uid = role.metadata.uid.clone().ok_or_else(|| {
        Error::internal_with_context("reconciler", format!("ClusterRole {} has no uid", name))
    })?;
    Ok(OwnerReference {
        api_version: RBAC_API_VERSION.to_string(),
        kind: "ClusterRole".to_string(),
        name,
        uid,
        ..Default::default()
    })
}

fn has_token_secret(sa: &ServiceAccount) -> bool {
    sa.secrets.as_ref().is_some_and(|s| !s.is_empty())
}

/// Provisions and reads impersonation principals on one downstream cluster
pub struct Impersonator {
    client: Arc<dyn RemoteClient>,
    config: ImpersonationConfig,
}

impl Impersonator {
    /// Create a reconciler for the cluster behind `client`
    pub fn new(client: Arc<dyn RemoteClient>, config: ImpersonationConfig) -> Self {
        Self { client, config }
    }

    /// Configuration in use
    pub fn config(&self) -> &ImpersonationConfig {
        &self.config
    }

    /// Ensure the principal set for `identity` and return its ready
    /// ServiceAccount.
    ///
    /// When the ClusterRole already carries exactly the rules this identity
    /// needs, no writes are made and the cached ServiceAccount is returned.
    /// Fails with [`Error::NotReady`] if the token secret never shows up.
    #[instrument(skip(self, identity), fields(user = %identity.uid()))]
    pub async fn set_up(&self, identity: &Identity) -> Result<ServiceAccount, Error> {
        let name = self.config.principal_name(identity.uid());
        let rules = rules_for_identity(identity);

        trace!("Checking impersonation role");
        let existing = self.check_and_update_role(&name, &rules).await?;
        let existing = match existing {
            RoleState::Current(role) => {
                if let Some(sa) = self
                    .client
                    .get_service_account(&self.config.namespace, &name, Read::Cached)
                    .await?
                {
                    return Ok(sa);
                }
                debug!(name = %name, "Role is current but ServiceAccount is missing, re-ensuring");
                Some(role)
            }
            RoleState::Updated(role) => Some(role),
            RoleState::Absent => None,
        };

        trace!("Ensuring impersonation namespace");
        self.ensure_namespace().await?;

        let role = match existing {
            Some(role) => role,
            None => {
                trace!("Creating impersonation role");
                self.create_role(&name, rules).await?
            }
        };

        trace!("Ensuring impersonation service account");
        self.ensure_service_account(&name, &role).await?;

        trace!("Ensuring impersonation role binding");
        self.ensure_binding(&name, &role).await?;

        trace!("Waiting for service account to become active");
        self.wait_for_service_account(&name).await
    }

    /// Read the bearer token attached to `sa`.
    ///
    /// No secret reference, or a referenced secret that does not exist, is
    /// [`Error::NotReady`]. A secret without a UTF-8 `token` entry is
    /// [`Error::InvalidSecret`].
    pub async fn get_token(&self, sa: &ServiceAccount) -> Result<String, Error> {
        let namespace = &self.config.namespace;
        let sa_name = sa.metadata.name.clone().unwrap_or_default();
        let secret_name = sa
            .secrets
            .as_ref()
            .and_then(|secrets| secrets.first())
            .and_then(|r| r.name.clone())
            .ok_or_else(|| Error::not_ready(namespace, &sa_name, 0))?;

        let secret = match self
            .client
            .get_secret(namespace, &secret_name, Read::Cached)
            .await?
        {
            Some(secret) => Some(secret),
            None => {
                trace!(secret = %secret_name, "Token secret not cached yet, reading from server");
                self.client
                    .get_secret(namespace, &secret_name, Read::Authoritative)
                    .await?
            }
        };
        let secret = secret.ok_or_else(|| Error::not_ready(namespace, &sa_name, 0))?;

        let token = secret
            .data
            .as_ref()
            .and_then(|data| data.get(TOKEN_KEY))
            .ok_or_else(|| {
                Error::invalid_secret(namespace, &secret_name, format!("missing key {}", TOKEN_KEY))
            })?;

        String::from_utf8(token.0.clone()).map_err(|_| {
            Error::invalid_secret(namespace, &secret_name, "token is not valid UTF-8")
        })
    }

    /// Look up the ServiceAccount provisioned for `uid`, if any
    pub async fn service_account(&self, uid: &str) -> Result<Option<ServiceAccount>, Error> {
        let name = self.config.principal_name(uid);
        let namespace = &self.config.namespace;
        match self
            .client
            .get_service_account(namespace, &name, Read::Cached)
            .await?
        {
            Some(sa) => Ok(Some(sa)),
            None => {
                self.client
                    .get_service_account(namespace, &name, Read::Authoritative)
                    .await
            }
        }
    }

    async fn check_and_update_role(
        &self,
        name: &str,
        rules: &[PolicyRule],
    ) -> Result<RoleState, Error> {
        let Some(mut role) = self.client.get_cluster_role(name, Read::Cached).await? else {
            return Ok(RoleState::Absent);
        };
        if role.rules.as_deref().unwrap_or_default() == rules {
            return Ok(RoleState::Current(role));
        }
        debug!(name = %name, "Impersonation rules changed, updating role");
        role.rules = Some(rules.to_vec());
        let updated = self.client.update_cluster_role(&role).await?;
        Ok(RoleState::Updated(updated))
    }

    async fn ensure_namespace(&self) -> Result<(), Error> {
        let namespace = &self.config.namespace;
        if self
            .client
            .get_namespace(namespace, Read::Cached)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.clone()),
                labels: Some(impersonation_labels()),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.client.create_namespace(&ns).await {
            Ok(_) => {
                debug!(namespace = %namespace, "Created impersonation namespace");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_role(&self, name: &str, rules: Vec<PolicyRule>) -> Result<ClusterRole, Error> {
        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(impersonation_labels()),
                ..Default::default()
            },
            rules: Some(rules),
            ..Default::default()
        };
        match self.client.create_cluster_role(&role).await {
            Ok(created) => {
                debug!(name = %name, "Created impersonation role");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => self
                .client
                .get_cluster_role(name, Read::Authoritative)
                .await?
                .ok_or_else(|| Error::not_found("ClusterRole", name)),
            Err(e) => Err(e),
        }
    }

    async fn ensure_service_account(
        &self,
        name: &str,
        role: &ClusterRole,
    ) -> Result<ServiceAccount, Error> {
        let namespace = &self.config.namespace;
        if let Some(sa) = self
            .client
            .get_service_account(namespace, name, Read::Cached)
            .await?
        {
            return Ok(sa);
        }

        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.clone()),
                labels: Some(impersonation_labels()),
                owner_references: Some(vec![owned_by(role)?]),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.client.create_service_account(&sa).await {
            Ok(created) => {
                debug!(namespace = %namespace, name = %name, "Created impersonation service account");
                Ok(created)
            }
            // The cache may not have seen the concurrent creator yet
            Err(e) if e.is_already_exists() => self
                .client
                .get_service_account(namespace, name, Read::Authoritative)
                .await?
                .ok_or_else(|| Error::not_found("ServiceAccount", format!("{}/{}", namespace, name))),
            Err(e) => Err(e),
        }
    }

    async fn ensure_binding(&self, name: &str, role: &ClusterRole) -> Result<(), Error> {
        if self
            .client
            .get_cluster_role_binding(name, Read::Cached)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(impersonation_labels()),
                owner_references: Some(vec![owned_by(role)?]),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: role.metadata.name.clone().unwrap_or_default(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            }]),
        };
        match self.client.create_cluster_role_binding(&binding).await {
            Ok(_) => {
                debug!(name = %name, "Created impersonation role binding");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_service_account(&self, name: &str) -> Result<ServiceAccount, Error> {
        let namespace = &self.config.namespace;
        debug!(
            namespace = %namespace,
            name = %name,
            attempts = self.config.readiness.max_attempts,
            budget_ms = self.config.readiness.total_delay().as_millis() as u64,
            "Waiting for service account to be ready"
        );

        let ready = poll_with_backoff(&self.config.readiness, "wait_for_service_account", || async {
            let sa = self
                .client
                .get_service_account(namespace, name, Read::Cached)
                .await?;
            Ok::<_, Error>(sa.filter(has_token_secret))
        })
        .await?;

        match ready {
            Some(sa) => Ok(sa),
            None => {
                self.trace_cached_service_accounts().await;
                Err(Error::not_ready(
                    namespace,
                    name,
                    self.config.readiness.max_attempts.max(1),
                ))
            }
        }
    }

    async fn trace_cached_service_accounts(&self) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        let namespace = &self.config.namespace;
        match self.client.list_service_accounts(namespace, Read::Cached).await {
            Ok(sas) => {
                let names: Vec<String> = sas.iter().filter_map(|sa| sa.metadata.name.clone()).collect();
                trace!(namespace = %namespace, cached = ?names, "Cached service accounts");
            }
            Err(e) => trace!(error = %e, "Failed to list cached service accounts"),
        }
    }
}

enum RoleState {
    /// Rules already match
    Current(ClusterRole),
    /// Rules were replaced in place
    Updated(ClusterRole),
    Absent,
}
