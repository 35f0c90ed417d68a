//! Identity resolution
//!
//! Turns a management-plane user record plus its cached group-principal
//! attributes into the [`Identity`] the downstream cluster will see through
//! impersonation. Identities are rebuilt on every reconcile and never cached,
//! so a group membership change is picked up on the next grant event.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::trace;

use crate::Error;

/// Extras key holding the user's display username
pub const EXTRA_USERNAME: &str = "username";

/// Extras key holding the user's authentication principal IDs
pub const EXTRA_PRINCIPAL_ID: &str = "principalid";

/// A management-plane user record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserRecord {
    /// Object name; stable and used as the impersonated uid
    pub name: String,
    /// Human-readable username
    pub username: String,
    /// Authentication provider principal IDs (e.g. `local://u-abc12`)
    pub principal_ids: Vec<String>,
}

/// Cached group-principal attributes for a user
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserAttributes {
    /// Principal names per auth provider, iterated in provider order
    pub group_principals: BTreeMap<String, Vec<String>>,
}

/// Read-only access to the management-plane identity store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Fetch a user record by name. Absent users are [`Error::NotFound`].
    async fn get_user(&self, name: &str) -> Result<UserRecord, Error>;

    /// Fetch a user's group-principal attributes. Absent attributes are
    /// [`Error::NotFound`].
    async fn get_user_attributes(&self, name: &str) -> Result<UserAttributes, Error>;
}

/// The identity a ServiceAccount is allowed to impersonate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    uid: String,
    display_name: String,
    groups: Vec<String>,
    extras: BTreeMap<String, Vec<String>>,
}

impl Identity {
    /// Create an identity with no groups or extras.
    ///
    /// Fails if `uid` is empty: every object name is derived from it.
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>) -> Result<Self, Error> {
        let uid = uid.into();
        if uid.is_empty() {
            return Err(Error::validation("identity uid must not be empty"));
        }
        Ok(Self {
            uid,
            display_name: display_name.into(),
            groups: Vec::new(),
            extras: BTreeMap::new(),
        })
    }

    /// Append groups, skipping ones already present
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for group in groups {
            let group = group.into();
            if !self.groups.contains(&group) {
                self.groups.push(group);
            }
        }
        self
    }

    /// Set an extras attribute
    pub fn with_extra<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extras
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Stable user id
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Groups in resolution order
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Extras attributes
    pub fn extras(&self) -> &BTreeMap<String, Vec<String>> {
        &self.extras
    }

    /// Values of a single extras attribute
    pub fn extra(&self, key: &str) -> Option<&[String]> {
        self.extras.get(key).map(Vec::as_slice)
    }
}

/// Builds [`Identity`] values from the identity store
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    baseline_groups: Vec<String>,
}

impl IdentityResolver {
    /// Create a resolver that always includes `baseline_groups`
    pub fn new(store: Arc<dyn IdentityStore>, baseline_groups: Vec<String>) -> Self {
        Self {
            store,
            baseline_groups,
        }
    }

    /// Resolve a user and an optional extra group into an identity.
    ///
    /// A missing user is [`Error::NotFound`]; missing attributes are not an
    /// error, the user simply has no group principals.
    pub async fn resolve(&self, username: &str, groupname: Option<&str>) -> Result<Identity, Error> {
        let user = self.store.get_user(username).await?;

        let attributes = match self.store.get_user_attributes(username).await {
            Ok(attrs) => Some(attrs),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let principal_groups = attributes
            .iter()
            .flat_map(|a| a.group_principals.values())
            .flatten()
            .cloned();

        let mut identity = Identity::new(user.name.clone(), user.username.clone())?
            .with_groups(self.baseline_groups.iter().cloned())
            .with_groups(groupname.filter(|g| !g.is_empty()).map(str::to_string))
            .with_groups(principal_groups)
            .with_extra(EXTRA_USERNAME, [user.username.clone()]);

        if !user.principal_ids.is_empty() {
            identity = identity.with_extra(EXTRA_PRINCIPAL_ID, user.principal_ids.clone());
        }

        trace!(
            user = %identity.uid(),
            groups = identity.groups().len(),
            "Resolved identity"
        );
        Ok(identity)
    }
}
