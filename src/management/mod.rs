//! Management-plane collaborators
//!
//! kube-rs implementations of [`IdentityStore`] and [`GrantIndex`] reading
//! `management.cattle.io/v3` objects from the management cluster.

mod types;

pub use types::{
    parse_grant, parse_user, parse_user_attributes, user_attribute_resource, user_resource, Grant,
    GrantKind, MANAGEMENT_GROUP, MANAGEMENT_VERSION,
};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, trace, warn};

use crate::identity::{IdentityStore, UserAttributes, UserRecord};
use crate::kube_utils::{spawn_cache, wait_for_cache};
use crate::lifecycle::{GrantIndex, GrantReference};
use crate::Error;

/// Reads users and user attributes from the management cluster
pub struct KubeIdentityStore {
    users: Api<DynamicObject>,
    attributes: Api<DynamicObject>,
}

impl KubeIdentityStore {
    /// Create a store backed by `client`
    pub fn new(client: Client) -> Self {
        Self {
            users: Api::all_with(client.clone(), &user_resource()),
            attributes: Api::all_with(client, &user_attribute_resource()),
        }
    }
}

async fn get_dynamic(api: &Api<DynamicObject>, kind: &str, name: &str) -> Result<DynamicObject, Error> {
    api.get_opt(name)
        .await
        .map_err(|e| Error::from_kube(kind, name, e))?
        .ok_or_else(|| Error::not_found(kind, name))
}

#[async_trait]
impl IdentityStore for KubeIdentityStore {
    async fn get_user(&self, name: &str) -> Result<UserRecord, Error> {
        let obj = get_dynamic(&self.users, "User", name).await?;
        parse_user(&obj)
    }

    async fn get_user_attributes(&self, name: &str) -> Result<UserAttributes, Error> {
        let obj = get_dynamic(&self.attributes, "UserAttribute", name).await?;
        parse_user_attributes(&obj)
    }
}

/// Finds grants of one kind that reference a user on a cluster.
///
/// Backed by a watch cache over every grant of that kind, synced before the
/// index is handed out.
pub struct KubeGrantIndex {
    store: Store<DynamicObject>,
    kind: GrantKind,
}

impl KubeGrantIndex {
    /// Start caching `kind` grants in every namespace and wait for the sync
    pub async fn start(client: Client, kind: GrantKind) -> Result<Self, Error> {
        let resource = kind.api_resource();
        let api: Api<DynamicObject> = Api::all_with(client, &resource);
        let store = spawn_cache(api, watcher::Config::default(), resource);
        wait_for_cache(&store, kind.kind()).await?;
        debug!(kind = kind.kind(), cached = store.state().len(), "Grant cache synced");
        Ok(Self { store, kind })
    }
}

/// Grants among `objects` that give `username` access on `cluster`.
///
/// An object that does not decode is logged and skipped; it cannot name the
/// user in a way this crate understands.
pub fn grants_referencing<'a>(
    kind: GrantKind,
    objects: impl IntoIterator<Item = &'a DynamicObject>,
    cluster: &str,
    username: &str,
) -> Vec<GrantReference> {
    objects
        .into_iter()
        .filter_map(|obj| match parse_grant(kind, obj) {
            Ok(grant) => Some(grant),
            Err(e) => {
                warn!(kind = kind.kind(), error = %e, "Skipping undecodable grant");
                None
            }
        })
        .filter(|grant| grant.references(cluster, username))
        .map(|grant| GrantReference {
            namespace: grant.namespace,
            name: grant.name,
        })
        .collect()
}

#[async_trait]
impl GrantIndex for KubeGrantIndex {
    async fn grants_for(&self, cluster: &str, username: &str) -> Result<Vec<GrantReference>, Error> {
        let cached = self.store.state();
        let refs = grants_referencing(
            self.kind,
            cached.iter().map(|obj| obj.as_ref()),
            cluster,
            username,
        );
        trace!(
            kind = self.kind.kind(),
            cluster = %cluster,
            user = %username,
            count = refs.len(),
            "Counted grants"
        );
        Ok(refs)
    }
}
