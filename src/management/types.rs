//! Management-plane object shapes
//!
//! Users, user attributes and role-template bindings are custom resources
//! in `management.cattle.io/v3` with their fields at the top level of the
//! object. They are read as [`DynamicObject`] and decoded here, keeping the
//! decoding pure so it can be tested without a cluster.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde::Deserialize;

use crate::identity::{UserAttributes, UserRecord};
use crate::Error;

/// API group of the management-plane resources
pub const MANAGEMENT_GROUP: &str = "management.cattle.io";

/// API version of the management-plane resources
pub const MANAGEMENT_VERSION: &str = "v3";

fn management_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: MANAGEMENT_GROUP.to_string(),
        version: MANAGEMENT_VERSION.to_string(),
        api_version: format!("{}/{}", MANAGEMENT_GROUP, MANAGEMENT_VERSION),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// `User` resource (cluster-scoped)
pub fn user_resource() -> ApiResource {
    management_resource("User", "users")
}

/// `UserAttribute` resource (cluster-scoped, same name as its user)
pub fn user_attribute_resource() -> ApiResource {
    management_resource("UserAttribute", "userattributes")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserFields {
    #[serde(default)]
    username: String,
    #[serde(default)]
    principal_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserAttributeFields {
    #[serde(default)]
    group_principals: BTreeMap<String, PrincipalList>,
}

#[derive(Debug, Default, Deserialize)]
struct PrincipalList {
    #[serde(default)]
    items: Vec<PrincipalItem>,
}

#[derive(Debug, Default, Deserialize)]
struct PrincipalItem {
    #[serde(default)]
    metadata: PrincipalMeta,
}

#[derive(Debug, Default, Deserialize)]
struct PrincipalMeta {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantFields {
    cluster_name: Option<String>,
    project_name: Option<String>,
    user_name: Option<String>,
    group_principal_name: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, obj: &DynamicObject) -> Result<T, Error> {
    serde_json::from_value(obj.data.clone()).map_err(|e| {
        Error::internal_with_context(
            "management",
            format!(
                "malformed {} {}: {}",
                kind,
                obj.metadata.name.as_deref().unwrap_or("<unnamed>"),
                e
            ),
        )
    })
}

/// Decode a `User` object. The object name is the stable user id.
pub fn parse_user(obj: &DynamicObject) -> Result<UserRecord, Error> {
    let fields: UserFields = decode("User", obj)?;
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::internal_with_context("management", "User without a name"))?;
    Ok(UserRecord {
        name,
        username: fields.username,
        principal_ids: fields.principal_ids,
    })
}

/// Decode a `UserAttribute` object into group principal names per provider
pub fn parse_user_attributes(obj: &DynamicObject) -> Result<UserAttributes, Error> {
    let fields: UserAttributeFields = decode("UserAttribute", obj)?;
    let group_principals = fields
        .group_principals
        .into_iter()
        .map(|(provider, list)| {
            let names = list
                .items
                .into_iter()
                .filter_map(|item| item.metadata.name)
                .filter(|name| !name.is_empty())
                .collect();
            (provider, names)
        })
        .collect();
    Ok(UserAttributes { group_principals })
}

/// The two grant kinds that reference a user on a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GrantKind {
    /// `ClusterRoleTemplateBinding`, scoped to one cluster
    Cluster,
    /// `ProjectRoleTemplateBinding`, scoped to one project of a cluster
    Project,
}

impl GrantKind {
    /// Kubernetes kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cluster => "ClusterRoleTemplateBinding",
            Self::Project => "ProjectRoleTemplateBinding",
        }
    }

    /// API resource for listing and watching this kind
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Cluster => management_resource(self.kind(), "clusterroletemplatebindings"),
            Self::Project => management_resource(self.kind(), "projectroletemplatebindings"),
        }
    }
}

/// A decoded grant
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Grant {
    /// Namespace of the grant object
    pub namespace: String,
    /// Name of the grant object
    pub name: String,
    /// Cluster the grant gives access to
    pub cluster: Option<String>,
    /// User granted access, absent for group-only grants
    pub user_name: Option<String>,
    /// Group principal granted access alongside the user
    pub group_principal_name: Option<String>,
    /// The grant is being deleted
    pub deleting: bool,
}

impl Grant {
    /// True if this grant gives `username` access on `cluster` and is not
    /// on its way out
    pub fn references(&self, cluster: &str, username: &str) -> bool {
        !self.deleting
            && self.cluster.as_deref() == Some(cluster)
            && self.user_name.as_deref() == Some(username)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Decode a grant object of the given kind.
///
/// Project grants name their project as `<cluster>:<project>`; the cluster
/// is the part before the colon.
pub fn parse_grant(kind: GrantKind, obj: &DynamicObject) -> Result<Grant, Error> {
    let fields: GrantFields = decode(kind.kind(), obj)?;
    let cluster = match kind {
        GrantKind::Cluster => non_empty(fields.cluster_name),
        GrantKind::Project => fields
            .project_name
            .as_deref()
            .and_then(|p| p.split_once(':'))
            .map(|(cluster, _)| cluster.to_string())
            .filter(|c| !c.is_empty()),
    };
    Ok(Grant {
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        cluster,
        user_name: non_empty(fields.user_name),
        group_principal_name: non_empty(fields.group_principal_name),
        deleting: obj.metadata.deletion_timestamp.is_some(),
    })
}
