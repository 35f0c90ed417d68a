//! Principal lifecycle
//!
//! Entry points driven by grant events. Ensuring resolves the user and runs
//! the reconciler; removing first counts the grants that still reference the
//! user on this cluster and only tears the principal set down once both the
//! cluster and project grant indexes are empty.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TeardownPolicy;
use crate::identity::IdentityResolver;
use crate::reconciler::Impersonator;
use crate::remote::{Read, RemoteClient};
use crate::Error;

/// A grant object that references a user on a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantReference {
    /// Namespace of the grant object
    pub namespace: String,
    /// Name of the grant object
    pub name: String,
}

/// Lookup of grants by `(cluster, username)`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GrantIndex: Send + Sync {
    /// All grants giving `username` access on `cluster`
    async fn grants_for(&self, cluster: &str, username: &str) -> Result<Vec<GrantReference>, Error>;
}

/// One object of a principal set, as seen by teardown
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrincipalObject {
    /// The ClusterRoleBinding
    Binding,
    /// The ServiceAccount
    ServiceAccount,
    /// The ClusterRole, owner of the other two
    ClusterRole,
}

/// Deletes needed to tear down a principal set, in order.
///
/// With owner cascade the ClusterRole is the only delete; the API server
/// garbage-collects its dependents. Otherwise dependents go first.
pub fn teardown_plan(policy: TeardownPolicy) -> &'static [PrincipalObject] {
    match policy {
        TeardownPolicy::OwnerCascade => &[PrincipalObject::ClusterRole],
        TeardownPolicy::Explicit => &[
            PrincipalObject::Binding,
            PrincipalObject::ServiceAccount,
            PrincipalObject::ClusterRole,
        ],
    }
}

/// Ensure/remove entry points for one downstream cluster
pub struct ImpersonationManager {
    cluster_name: String,
    resolver: IdentityResolver,
    cluster_grants: Arc<dyn GrantIndex>,
    project_grants: Arc<dyn GrantIndex>,
    impersonator: Impersonator,
    remote: Arc<dyn RemoteClient>,
}

impl ImpersonationManager {
    /// Create a manager.
    ///
    /// `remote` must be the client `impersonator` was built with; teardown
    /// deletes through it directly.
    pub fn new(
        cluster_name: impl Into<String>,
        resolver: IdentityResolver,
        cluster_grants: Arc<dyn GrantIndex>,
        project_grants: Arc<dyn GrantIndex>,
        impersonator: Impersonator,
        remote: Arc<dyn RemoteClient>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            resolver,
            cluster_grants,
            project_grants,
            impersonator,
            remote,
        }
    }

    /// Cluster this manager provisions principals on
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Make sure `username` has a ready impersonation principal.
    ///
    /// An unknown user is logged and skipped so it cannot block other grants.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn ensure_principal(&self, username: &str, groupname: Option<&str>) -> Result<(), Error> {
        let identity = match self.resolver.resolve(username, groupname).await {
            Ok(identity) => identity,
            Err(e) if e.is_not_found() => {
                warn!(user = %username, "Could not find user, will not create impersonation account on cluster");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        debug!(user = %identity.uid(), "Ensuring service account impersonator");
        self.impersonator.set_up(&identity).await?;
        Ok(())
    }

    /// Remove `username`'s principal set unless a grant still references it.
    ///
    /// Returns whether the teardown ran.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn remove_principal(&self, username: &str) -> Result<bool, Error> {
        let cluster_grants = self.cluster_grants.grants_for(&self.cluster_name, username).await?;
        let project_grants = self.project_grants.grants_for(&self.cluster_name, username).await?;
        let remaining = cluster_grants.len() + project_grants.len();
        if remaining > 0 {
            debug!(user = %username, remaining, "User still has grants, keeping impersonator");
            return Ok(false);
        }

        let config = self.impersonator.config();
        let name = config.principal_name(username);
        debug!(user = %username, "Deleting service account impersonator");

        for object in teardown_plan(config.teardown) {
            let result = match object {
                PrincipalObject::Binding => self.remote.delete_cluster_role_binding(&name).await,
                PrincipalObject::ServiceAccount => {
                    self.remote
                        .delete_service_account(&config.namespace, &name)
                        .await
                }
                PrincipalObject::ClusterRole => self.remote.delete_cluster_role(&name).await,
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Tear down every principal whose user has no grant left on this cluster.
    ///
    /// Walks the cached impersonation ClusterRoles, so users whose last grant
    /// vanished without an observed event are still cleaned up. A failure for
    /// one user is logged and the walk continues. Returns the removed users.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn sweep(&self) -> Result<Vec<String>, Error> {
        let prefix = &self.impersonator.config().name_prefix;
        let roles = self.remote.list_cluster_roles(Read::Cached).await?;

        let mut removed = Vec::new();
        for role in &roles {
            let Some(username) = role
                .metadata
                .name
                .as_deref()
                .and_then(|name| name.strip_prefix(prefix.as_str()))
                .filter(|username| !username.is_empty())
            else {
                continue;
            };
            match self.remove_principal(username).await {
                Ok(true) => removed.push(username.to_string()),
                Ok(false) => {}
                Err(e) => warn!(user = %username, error = %e, "Failed to sweep impersonation principal"),
            }
        }

        if removed.is_empty() {
            trace!(checked = roles.len(), "No orphaned impersonation principals");
        } else {
            info!(removed = ?removed, "Removed impersonation principals without grants");
        }
        Ok(removed)
    }

    /// Bearer token of `username`'s impersonation ServiceAccount
    pub async fn token_for(&self, username: &str) -> Result<String, Error> {
        let sa = self
            .impersonator
            .service_account(username)
            .await?
            .ok_or_else(|| {
                let config = self.impersonator.config();
                Error::not_found(
                    "ServiceAccount",
                    format!("{}/{}", config.namespace, config.principal_name(username)),
                )
            })?;
        self.impersonator.get_token(&sa).await
    }
}
