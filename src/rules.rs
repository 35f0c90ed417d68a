//! Impersonation policy rules
//!
//! The rule list is compared by value against the ClusterRole already on the
//! cluster to decide whether an update is needed, so the order and presence
//! of rules here is part of the contract:
//!
//! 1. `users` - always, naming the uid
//! 2. `groups` - only when the identity has groups
//! 3. `userextras/principalid` - only when the extra is set
//! 4. `userextras/username` - only when the extra is set

use k8s_openapi::api::rbac::v1::PolicyRule;

use crate::identity::{Identity, EXTRA_PRINCIPAL_ID, EXTRA_USERNAME};

/// The only verb granted
pub const IMPERSONATE_VERB: &str = "impersonate";

/// API group for user extras
pub const AUTHENTICATION_API_GROUP: &str = "authentication.k8s.io";

fn impersonate_rule(api_group: &str, resource: &str, names: &[String]) -> PolicyRule {
    PolicyRule {
        verbs: vec![IMPERSONATE_VERB.to_string()],
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        resource_names: Some(names.to_vec()),
        ..Default::default()
    }
}

/// Rules allowing impersonation of exactly this identity
pub fn rules_for_identity(identity: &Identity) -> Vec<PolicyRule> {
    let mut rules = vec![impersonate_rule(
        "",
        "users",
        &[identity.uid().to_string()],
    )];

    if !identity.groups().is_empty() {
        rules.push(impersonate_rule("", "groups", identity.groups()));
    }
    if let Some(principal_ids) = identity.extra(EXTRA_PRINCIPAL_ID) {
        rules.push(impersonate_rule(
            AUTHENTICATION_API_GROUP,
            "userextras/principalid",
            principal_ids,
        ));
    }
    if let Some(usernames) = identity.extra(EXTRA_USERNAME) {
        rules.push(impersonate_rule(
            AUTHENTICATION_API_GROUP,
            "userextras/username",
            usernames,
        ));
    }

    rules
}
