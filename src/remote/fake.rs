//! In-memory [`RemoteClient`] for tests
//!
//! Models the behaviors the reconciler has to cope with: a cache that can lag
//! behind the server, create races against another writer, token secrets
//! attached some polls after the ServiceAccount appears, ownership cascade on
//! delete, and injected read failures. Every write attempt is logged so
//! tests can assert on idempotence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::ByteString;

use super::{Read, RemoteClient};
use crate::{Error, TOKEN_KEY};

pub(crate) const NAMESPACE: &str = "Namespace";
pub(crate) const CLUSTER_ROLE: &str = "ClusterRole";
pub(crate) const BINDING: &str = "ClusterRoleBinding";
pub(crate) const SERVICE_ACCOUNT: &str = "ServiceAccount";
pub(crate) const SECRET: &str = "Secret";

/// A write attempt, successful or not
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Write {
    Create(&'static str, String),
    Update(&'static str, String),
    Delete(&'static str, String),
}

type Key = (&'static str, String);

fn key(kind: &'static str, name: &str) -> Key {
    (kind, name.to_string())
}

fn ns_key(kind: &'static str, namespace: &str, name: &str) -> Key {
    (kind, format!("{}/{}", namespace, name))
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    roles: BTreeMap<String, ClusterRole>,
    bindings: BTreeMap<String, ClusterRoleBinding>,
    service_accounts: BTreeMap<String, ServiceAccount>,
    secrets: BTreeMap<String, Secret>,
    /// Objects the cache has not observed yet; the next cached read misses
    unsynced: HashSet<Key>,
    /// Remaining cached polls before a ServiceAccount gets its token
    pending_tokens: HashMap<String, u32>,
    /// Kinds whose next create loses a race to another writer
    races: HashSet<&'static str>,
    failing_reads: HashSet<&'static str>,
    /// Reads of a kind that still succeed before every later one fails
    read_budgets: HashMap<&'static str, u32>,
    cached_reads: HashMap<Key, u32>,
    writes: Vec<Write>,
    next_uid: u64,
    attach_tokens: bool,
    token_delay_polls: u32,
    cascade: bool,
}

impl State {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{}", self.next_uid)
    }

    fn check_read(&mut self, kind: &'static str, k: &Key, read: Read) -> Result<bool, Error> {
        if read == Read::Cached {
            *self.cached_reads.entry(k.clone()).or_default() += 1;
        }
        let exhausted = match self.read_budgets.get_mut(kind) {
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        };
        if exhausted || self.failing_reads.contains(kind) {
            return Err(Error::internal_with_context("fake", format!("injected {} read failure", kind)));
        }
        if read == Read::Cached {
            if self.unsynced.remove(k) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn attach_token(&mut self, namespace: &str, name: &str) {
        let sa_key = format!("{}/{}", namespace, name);
        let secret_name = format!("{}-token-x7k2p", name);
        if let Some(sa) = self.service_accounts.get_mut(&sa_key) {
            sa.secrets = Some(vec![ObjectReference {
                name: Some(secret_name.clone()),
                ..Default::default()
            }]);
        }
        let mut secret = Secret {
            type_: Some("kubernetes.io/service-account-token".to_string()),
            data: Some(BTreeMap::from([(
                TOKEN_KEY.to_string(),
                ByteString(format!("token-for-{}", name).into_bytes()),
            )])),
            ..Default::default()
        };
        secret.metadata.name = Some(secret_name.clone());
        secret.metadata.namespace = Some(namespace.to_string());
        self.secrets.insert(format!("{}/{}", namespace, secret_name), secret);
    }

    fn owned_by(owner_uid: &str, refs: Option<&Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>>) -> bool {
        refs.map(|refs| refs.iter().any(|r| r.uid == owner_uid))
            .unwrap_or(false)
    }
}

/// In-memory downstream cluster
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// Cluster that attaches tokens immediately and cascades owner deletes
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                attach_tokens: true,
                cascade: true,
                ..Default::default()
            }),
        }
    }

    /// Never attach token secrets to ServiceAccounts
    pub(crate) fn without_token_controller(self) -> Self {
        self.state.lock().unwrap().attach_tokens = false;
        self
    }

    /// Attach tokens only after this many cached ServiceAccount reads
    pub(crate) fn with_token_delay(self, polls: u32) -> Self {
        self.state.lock().unwrap().token_delay_polls = polls;
        self
    }

    /// Do not garbage-collect dependents when an owner is deleted
    pub(crate) fn without_cascade(self) -> Self {
        self.state.lock().unwrap().cascade = false;
        self
    }

    /// Make the next create of `kind` lose a race to a concurrent writer
    pub(crate) fn race_next_create(&self, kind: &'static str) {
        self.state.lock().unwrap().races.insert(kind);
    }

    /// Fail every read of `kind`
    pub(crate) fn fail_reads(&self, kind: &'static str) {
        self.state.lock().unwrap().failing_reads.insert(kind);
    }

    /// Let `reads` more reads of `kind` succeed, then fail every later one
    pub(crate) fn fail_reads_after(&self, kind: &'static str, reads: u32) {
        self.state.lock().unwrap().read_budgets.insert(kind, reads);
    }

    /// Place a ClusterRole on the server as if another writer created it
    pub(crate) fn seed_cluster_role(&self, mut role: ClusterRole) -> ClusterRole {
        let mut state = self.state.lock().unwrap();
        role.metadata.uid = Some(state.uid());
        role.metadata.resource_version = Some("1".to_string());
        let name = role.metadata.name.clone().unwrap_or_default();
        state.roles.insert(name, role.clone());
        role
    }

    pub(crate) fn writes(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    pub(crate) fn cached_reads(&self, kind: &'static str, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .cached_reads
            .get(&key(kind, name))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn cluster_role(&self, name: &str) -> Option<ClusterRole> {
        self.state.lock().unwrap().roles.get(name).cloned()
    }

    pub(crate) fn binding(&self, name: &str) -> Option<ClusterRoleBinding> {
        self.state.lock().unwrap().bindings.get(name).cloned()
    }

    pub(crate) fn namespace(&self, name: &str) -> Option<Namespace> {
        self.state.lock().unwrap().namespaces.get(name).cloned()
    }

    pub(crate) fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    /// Remove a ServiceAccount out from under the reconciler
    pub(crate) fn drop_service_account(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .remove(&format!("{}/{}", namespace, name));
    }
}

#[async_trait]
impl RemoteClient for FakeCluster {
    async fn get_namespace(&self, name: &str, read: Read) -> Result<Option<Namespace>, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.check_read(NAMESPACE, &key(NAMESPACE, name), read)? {
            return Ok(None);
        }
        Ok(state.namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error> {
        let mut state = self.state.lock().unwrap();
        let name = namespace.metadata.name.clone().unwrap_or_default();
        state.writes.push(Write::Create(NAMESPACE, name.clone()));
        if state.races.remove(NAMESPACE) {
            let mut theirs = namespace.clone();
            theirs.metadata.uid = Some(state.uid());
            state.namespaces.insert(name.clone(), theirs);
            state.unsynced.insert(key(NAMESPACE, &name));
        }
        if state.namespaces.contains_key(&name) {
            return Err(Error::already_exists(NAMESPACE, name));
        }
        let mut created = namespace.clone();
        created.metadata.uid = Some(state.uid());
        state.namespaces.insert(name, created.clone());
        Ok(created)
    }

    async fn get_cluster_role(&self, name: &str, read: Read) -> Result<Option<ClusterRole>, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.check_read(CLUSTER_ROLE, &key(CLUSTER_ROLE, name), read)? {
            return Ok(None);
        }
        Ok(state.roles.get(name).cloned())
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error> {
        let mut state = self.state.lock().unwrap();
        let name = role.metadata.name.clone().unwrap_or_default();
        state.writes.push(Write::Create(CLUSTER_ROLE, name.clone()));
        if state.races.remove(CLUSTER_ROLE) {
            let mut theirs = role.clone();
            theirs.metadata.uid = Some(state.uid());
            theirs.metadata.resource_version = Some("1".to_string());
            state.roles.insert(name.clone(), theirs);
            state.unsynced.insert(key(CLUSTER_ROLE, &name));
        }
        if state.roles.contains_key(&name) {
            return Err(Error::already_exists(CLUSTER_ROLE, name));
        }
        let mut created = role.clone();
        created.metadata.uid = Some(state.uid());
        created.metadata.resource_version = Some("1".to_string());
        state.roles.insert(name, created.clone());
        Ok(created)
    }

    async fn update_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error> {
        let mut state = self.state.lock().unwrap();
        let name = role.metadata.name.clone().unwrap_or_default();
        state.writes.push(Write::Update(CLUSTER_ROLE, name.clone()));
        let existing = state
            .roles
            .get_mut(&name)
            .ok_or_else(|| Error::not_found(CLUSTER_ROLE, name.clone()))?;
        let version: u64 = existing
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        existing.rules = role.rules.clone();
        existing.metadata.resource_version = Some((version + 1).to_string());
        Ok(existing.clone())
    }

    async fn list_cluster_roles(&self, _read: Read) -> Result<Vec<ClusterRole>, Error> {
        let state = self.state.lock().unwrap();
        if state.failing_reads.contains(CLUSTER_ROLE) {
            return Err(Error::internal_with_context("fake", "injected ClusterRole list failure"));
        }
        Ok(state.roles.values().cloned().collect())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.writes.push(Write::Delete(CLUSTER_ROLE, name.to_string()));
        let role = state
            .roles
            .remove(name)
            .ok_or_else(|| Error::not_found(CLUSTER_ROLE, name))?;
        if state.cascade {
            let uid = role.metadata.uid.unwrap_or_default();
            state
                .service_accounts
                .retain(|_, sa| !State::owned_by(&uid, sa.metadata.owner_references.as_ref()));
            state
                .bindings
                .retain(|_, b| !State::owned_by(&uid, b.metadata.owner_references.as_ref()));
        }
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
        read: Read,
    ) -> Result<Option<ServiceAccount>, Error> {
        let mut state = self.state.lock().unwrap();
        let k = ns_key(SERVICE_ACCOUNT, namespace, name);
        if !state.check_read(SERVICE_ACCOUNT, &k, read)? {
            return Ok(None);
        }
        if read == Read::Cached {
            if let Some(remaining) = state.pending_tokens.get_mut(&k.1) {
                if *remaining == 0 {
                    state.pending_tokens.remove(&k.1);
                    state.attach_token(namespace, name);
                } else {
                    *remaining -= 1;
                }
            }
        }
        Ok(state.service_accounts.get(&k.1).cloned())
    }

    async fn list_service_accounts(
        &self,
        namespace: &str,
        _read: Read,
    ) -> Result<Vec<ServiceAccount>, Error> {
        let state = self.state.lock().unwrap();
        let prefix = format!("{}/", namespace);
        Ok(state
            .service_accounts
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, sa)| sa.clone())
            .collect())
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount, Error> {
        let mut state = self.state.lock().unwrap();
        let namespace = sa.metadata.namespace.clone().unwrap_or_default();
        let name = sa.metadata.name.clone().unwrap_or_default();
        let k = ns_key(SERVICE_ACCOUNT, &namespace, &name);
        state.writes.push(Write::Create(SERVICE_ACCOUNT, k.1.clone()));

        let raced = state.races.remove(SERVICE_ACCOUNT);
        if state.service_accounts.contains_key(&k.1) && !raced {
            return Err(Error::already_exists(SERVICE_ACCOUNT, k.1));
        }

        let mut created = sa.clone();
        created.metadata.uid = Some(state.uid());
        state.service_accounts.insert(k.1.clone(), created.clone());
        if state.attach_tokens {
            if state.token_delay_polls == 0 {
                state.attach_token(&namespace, &name);
            } else {
                let delay = state.token_delay_polls;
                state.pending_tokens.insert(k.1.clone(), delay);
            }
        }

        if raced {
            state.unsynced.insert(k.clone());
            return Err(Error::already_exists(SERVICE_ACCOUNT, k.1));
        }
        Ok(state.service_accounts[&k.1].clone())
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = ns_key(SERVICE_ACCOUNT, namespace, name);
        state.writes.push(Write::Delete(SERVICE_ACCOUNT, k.1.clone()));
        state
            .service_accounts
            .remove(&k.1)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(SERVICE_ACCOUNT, k.1))
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
        read: Read,
    ) -> Result<Option<ClusterRoleBinding>, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.check_read(BINDING, &key(BINDING, name), read)? {
            return Ok(None);
        }
        Ok(state.bindings.get(name).cloned())
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, Error> {
        let mut state = self.state.lock().unwrap();
        let name = binding.metadata.name.clone().unwrap_or_default();
        state.writes.push(Write::Create(BINDING, name.clone()));
        if state.races.remove(BINDING) {
            let mut theirs = binding.clone();
            theirs.metadata.uid = Some(state.uid());
            state.bindings.insert(name.clone(), theirs);
            state.unsynced.insert(key(BINDING, &name));
        }
        if state.bindings.contains_key(&name) {
            return Err(Error::already_exists(BINDING, name));
        }
        let mut created = binding.clone();
        created.metadata.uid = Some(state.uid());
        state.bindings.insert(name, created.clone());
        Ok(created)
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.writes.push(Write::Delete(BINDING, name.to_string()));
        state
            .bindings
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(BINDING, name))
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
        read: Read,
    ) -> Result<Option<Secret>, Error> {
        let mut state = self.state.lock().unwrap();
        let k = ns_key(SECRET, namespace, name);
        if !state.check_read(SECRET, &k, read)? {
            return Ok(None);
        }
        Ok(state.secrets.get(&k.1).cloned())
    }
}

impl FakeCluster {
    /// Overwrite a token secret's payload
    pub(crate) fn set_secret_data(&self, namespace: &str, name: &str, data: BTreeMap<String, ByteString>) {
        let mut state = self.state.lock().unwrap();
        if let Some(secret) = state.secrets.get_mut(&format!("{}/{}", namespace, name)) {
            secret.data = Some(data);
        }
    }

    /// Remove a secret
    pub(crate) fn drop_secret(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .secrets
            .remove(&format!("{}/{}", namespace, name));
    }
}
