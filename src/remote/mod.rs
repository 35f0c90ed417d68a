//! Downstream cluster client
//!
//! Every read takes an explicit [`Read`] so the cache-versus-server choice is
//! visible at each call site. Probing goes through the cache; after a create
//! loses a race the reconciler re-reads from the server, because the cache
//! may not have observed the concurrent creator yet.
//!
//! Write and read failures are classified with [`Error::from_kube`]: absence
//! is `Ok(None)` on reads and [`Error::NotFound`] on deletes, create races
//! are [`Error::AlreadyExists`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
#[cfg(test)]
use mockall::automock;

use crate::Error;

mod kube_client;

#[cfg(test)]
pub(crate) mod fake;

pub use kube_client::KubeRemoteClient;

/// Where a read is served from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Read {
    /// Local watch cache: cheap, eventually consistent
    Cached,
    /// API server: authoritative, one round trip
    Authoritative,
}

/// Operations the reconciler needs against the downstream cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Get a namespace
    async fn get_namespace(&self, name: &str, read: Read) -> Result<Option<Namespace>, Error>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error>;

    /// Get a ClusterRole
    async fn get_cluster_role(&self, name: &str, read: Read) -> Result<Option<ClusterRole>, Error>;

    /// Create a ClusterRole
    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error>;

    /// Replace a ClusterRole (the object must carry its resourceVersion)
    async fn update_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error>;

    /// List the impersonation-labelled ClusterRoles
    async fn list_cluster_roles(&self, read: Read) -> Result<Vec<ClusterRole>, Error>;

    /// Delete a ClusterRole with background propagation
    async fn delete_cluster_role(&self, name: &str) -> Result<(), Error>;

    /// Get a ServiceAccount
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
        read: Read,
    ) -> Result<Option<ServiceAccount>, Error>;

    /// List ServiceAccounts in a namespace
    async fn list_service_accounts(
        &self,
        namespace: &str,
        read: Read,
    ) -> Result<Vec<ServiceAccount>, Error>;

    /// Create a ServiceAccount in its own metadata namespace
    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount, Error>;

    /// Delete a ServiceAccount
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a ClusterRoleBinding
    async fn get_cluster_role_binding(
        &self,
        name: &str,
        read: Read,
    ) -> Result<Option<ClusterRoleBinding>, Error>;

    /// Create a ClusterRoleBinding
    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, Error>;

    /// Delete a ClusterRoleBinding
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error>;

    /// Get a Secret
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
        read: Read,
    ) -> Result<Option<Secret>, Error>;
}
