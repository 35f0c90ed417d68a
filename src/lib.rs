//! Impersonator - per-user impersonation principals on downstream clusters
//!
//! Grants a management-plane user scoped, auditable access to a downstream
//! cluster it holds no native credentials for. For every user with at least
//! one access grant on the cluster, a cluster-local ServiceAccount is
//! provisioned whose only permission is to impersonate that user, its groups
//! and its identity extras. The proxy then talks to the cluster with the
//! ServiceAccount token plus `Impersonate-*` headers.
//!
//! # Architecture
//!
//! Leaves first:
//! - [`identity`] - resolves a user record and its group principals into an [`identity::Identity`]
//! - [`rules`] - derives the impersonation `PolicyRule` list for an identity
//! - [`reconciler`] - idempotently ensures namespace, ClusterRole, ServiceAccount and binding,
//!   then waits for the token secret to be attached
//! - [`lifecycle`] - ensure/remove entry points driven by grant events, with
//!   reference-counted teardown and a sweep for principals without grants
//! - [`controller`] - reconciles grant objects on the management cluster
//!
//! Supporting modules:
//! - [`remote`] - downstream cluster client with cached and authoritative reads
//! - [`management`] - management-plane identity store and grant indexes
//! - [`retry`] - bounded backoff polling
//! - [`config`] - injected configuration
//! - [`kube_utils`] - client construction from kubeconfig, watch caches
//! - [`telemetry`] - logging setup
//! - [`error`] - error taxonomy

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod kube_utils;
pub mod lifecycle;
pub mod management;
pub mod reconciler;
pub mod remote;
pub mod retry;
pub mod rules;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Wire Constants
// =============================================================================
// These are part of the contract with the downstream cluster and with other
// components that look impersonation objects up by name or label. Changing
// them orphans every principal already provisioned.

/// Label placed on every object this crate creates
pub const IMPERSONATION_LABEL: &str = "authz.cluster.cattle.io/impersonator";

/// Label selector matching [`IMPERSONATION_LABEL`]
pub const IMPERSONATION_LABEL_SELECTOR: &str = "authz.cluster.cattle.io/impersonator=true";

/// Shared system namespace holding every impersonation ServiceAccount
pub const IMPERSONATION_NAMESPACE: &str = "cattle-impersonation-system";

/// Prefix for the ClusterRole, ServiceAccount and ClusterRoleBinding names
pub const IMPERSONATION_PREFIX: &str = "cattle-impersonation-";

/// Data key holding the bearer token in a ServiceAccount token secret
pub const TOKEN_KEY: &str = "token";

/// Field manager used for writes against the downstream cluster
pub const FIELD_MANAGER: &str = "impersonator";
