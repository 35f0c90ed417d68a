//! kube-rs backed [`RemoteClient`]
//!
//! Writes and authoritative reads go straight to the API server. Cached
//! reads are served from reflector stores fed by watchers started in
//! [`KubeRemoteClient::start`]; the stores only hold what this crate manages
//! (objects carrying the impersonation label, plus token secrets in the
//! impersonation namespace).

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::info;

use super::{Read, RemoteClient};
use crate::kube_utils::{spawn_cache, wait_for_cache};
use crate::{Error, FIELD_MANAGER, IMPERSONATION_LABEL_SELECTOR};

/// Field selector for ServiceAccount token secrets
const TOKEN_SECRET_SELECTOR: &str = "type=kubernetes.io/service-account-token";

/// Downstream cluster client with watch caches for impersonation objects
pub struct KubeRemoteClient {
    client: Client,
    namespace: String,
    namespaces: Store<Namespace>,
    roles: Store<ClusterRole>,
    bindings: Store<ClusterRoleBinding>,
    service_accounts: Store<ServiceAccount>,
    secrets: Store<Secret>,
}

impl KubeRemoteClient {
    /// Start the watch caches and wait for them to sync.
    ///
    /// `namespace` is the impersonation namespace; ServiceAccount and Secret
    /// caches are scoped to it.
    pub async fn start(client: Client, namespace: &str) -> Result<Self, Error> {
        let labelled = watcher::Config::default().labels(IMPERSONATION_LABEL_SELECTOR);
        let namespace_only =
            watcher::Config::default().fields(&format!("metadata.name={}", namespace));
        let token_secrets = watcher::Config::default().fields(TOKEN_SECRET_SELECTOR);

        let this = Self {
            namespaces: spawn_cache(Api::all(client.clone()), namespace_only, ()),
            roles: spawn_cache(Api::all(client.clone()), labelled.clone(), ()),
            bindings: spawn_cache(Api::all(client.clone()), labelled.clone(), ()),
            service_accounts: spawn_cache(Api::namespaced(client.clone(), namespace), labelled, ()),
            secrets: spawn_cache(Api::namespaced(client.clone(), namespace), token_secrets, ()),
            namespace: namespace.to_string(),
            client,
        };

        wait_for_cache(&this.namespaces, "Namespace").await?;
        wait_for_cache(&this.roles, "ClusterRole").await?;
        wait_for_cache(&this.bindings, "ClusterRoleBinding").await?;
        wait_for_cache(&this.service_accounts, "ServiceAccount").await?;
        wait_for_cache(&this.secrets, "Secret").await?;

        info!(namespace = %this.namespace, "Impersonation caches synced");
        Ok(this)
    }

    fn in_cached_namespace(&self, namespace: &str) -> bool {
        namespace == self.namespace
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn object_name<K: Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

/// `display` is the name used in errors; namespaced callers qualify it.
async fn get_opt<K>(api: &Api<K>, kind: &str, name: &str, display: &str) -> Result<Option<K>, Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get_opt(name)
        .await
        .map_err(|e| Error::from_kube(kind, display, e))
}

async fn delete<K>(api: &Api<K>, kind: &str, name: &str) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::background())
        .await
        .map(|_| ())
        .map_err(|e| Error::from_kube(kind, name, e))
}

#[async_trait]
impl RemoteClient for KubeRemoteClient {
    async fn get_namespace(&self, name: &str, read: Read) -> Result<Option<Namespace>, Error> {
        match read {
            Read::Cached => Ok(self
                .namespaces
                .get(&ObjectRef::new(name))
                .map(|ns| ns.as_ref().clone())),
            Read::Authoritative => {
                get_opt(&Api::<Namespace>::all(self.client.clone()), "Namespace", name, name).await
            }
        }
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error> {
        let name = object_name(namespace);
        Api::<Namespace>::all(self.client.clone())
            .create(&post_params(), namespace)
            .await
            .map_err(|e| Error::from_kube("Namespace", &name, e))
    }

    async fn get_cluster_role(&self, name: &str, read: Read) -> Result<Option<ClusterRole>, Error> {
        match read {
            Read::Cached => Ok(self
                .roles
                .get(&ObjectRef::new(name))
                .map(|r| r.as_ref().clone())),
            Read::Authoritative => {
                get_opt(&Api::<ClusterRole>::all(self.client.clone()), "ClusterRole", name, name).await
            }
        }
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error> {
        let name = object_name(role);
        Api::<ClusterRole>::all(self.client.clone())
            .create(&post_params(), role)
            .await
            .map_err(|e| Error::from_kube("ClusterRole", &name, e))
    }

    async fn update_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error> {
        let name = object_name(role);
        Api::<ClusterRole>::all(self.client.clone())
            .replace(&name, &post_params(), role)
            .await
            .map_err(|e| Error::from_kube("ClusterRole", &name, e))
    }

    async fn list_cluster_roles(&self, read: Read) -> Result<Vec<ClusterRole>, Error> {
        match read {
            Read::Cached => Ok(self
                .roles
                .state()
                .iter()
                .map(|r| r.as_ref().clone())
                .collect()),
            Read::Authoritative => {
                let api: Api<ClusterRole> = Api::all(self.client.clone());
                let list = api
                    .list(&ListParams::default().labels(IMPERSONATION_LABEL_SELECTOR))
                    .await?;
                Ok(list.items)
            }
        }
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<(), Error> {
        delete(&Api::<ClusterRole>::all(self.client.clone()), "ClusterRole", name).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
        read: Read,
    ) -> Result<Option<ServiceAccount>, Error> {
        if read == Read::Cached && self.in_cached_namespace(namespace) {
            return Ok(self
                .service_accounts
                .get(&ObjectRef::new(name).within(namespace))
                .map(|sa| sa.as_ref().clone()));
        }
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, "ServiceAccount", name, &qualified(namespace, name)).await
    }

    async fn list_service_accounts(
        &self,
        namespace: &str,
        read: Read,
    ) -> Result<Vec<ServiceAccount>, Error> {
        if read == Read::Cached && self.in_cached_namespace(namespace) {
            return Ok(self
                .service_accounts
                .state()
                .iter()
                .map(|sa| sa.as_ref().clone())
                .collect());
        }
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(IMPERSONATION_LABEL_SELECTOR))
            .await?;
        Ok(list.items)
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount, Error> {
        let namespace = sa.metadata.namespace.clone().unwrap_or_default();
        let name = qualified(&namespace, &object_name(sa));
        Api::<ServiceAccount>::namespaced(self.client.clone(), &namespace)
            .create(&post_params(), sa)
            .await
            .map_err(|e| Error::from_kube("ServiceAccount", &name, e))
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube("ServiceAccount", &qualified(namespace, name), e))
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
        read: Read,
    ) -> Result<Option<ClusterRoleBinding>, Error> {
        match read {
            Read::Cached => Ok(self
                .bindings
                .get(&ObjectRef::new(name))
                .map(|b| b.as_ref().clone())),
            Read::Authoritative => {
                let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
                get_opt(&api, "ClusterRoleBinding", name, name).await
            }
        }
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, Error> {
        let name = object_name(binding);
        Api::<ClusterRoleBinding>::all(self.client.clone())
            .create(&post_params(), binding)
            .await
            .map_err(|e| Error::from_kube("ClusterRoleBinding", &name, e))
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        delete(&api, "ClusterRoleBinding", name).await
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
        read: Read,
    ) -> Result<Option<Secret>, Error> {
        if read == Read::Cached && self.in_cached_namespace(namespace) {
            return Ok(self
                .secrets
                .get(&ObjectRef::new(name).within(namespace))
                .map(|s| s.as_ref().clone()));
        }
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, "Secret", name, &qualified(namespace, name)).await
    }
}
