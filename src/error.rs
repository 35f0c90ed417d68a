//! Error types for impersonation provisioning
//!
//! Errors carry the kind and name of the object involved so that a failed
//! reconcile can be traced back to a concrete resource in logs. Absence and
//! write races are their own variants because callers treat them as control
//! flow rather than failure.

use thiserror::Error;

/// Main error type for impersonation operations
#[derive(Debug, Error)]
pub enum Error {
    /// An identity record or remote object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Object kind (e.g. "ClusterRole", "User")
        kind: String,
        /// Object name, namespace-qualified when namespaced
        name: String,
    },

    /// A create raced another writer
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
    },

    /// The ServiceAccount never gained a usable token
    #[error("service account {namespace}/{name} is not ready after {attempts} attempts")]
    NotReady {
        /// ServiceAccount namespace
        namespace: String,
        /// ServiceAccount name
        name: String,
        /// Poll attempts made before giving up (0 when no poll was involved)
        attempts: u32,
    },

    /// The token secret exists but has no usable token
    #[error("invalid token secret {namespace}/{name}: {message}")]
    InvalidSecret {
        /// Secret namespace
        namespace: String,
        /// Secret name
        name: String,
        /// What is wrong with the payload
        message: String,
    },

    /// Identity could not be built
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g. "cache", "management")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-ready error for a ServiceAccount
    pub fn not_ready(namespace: impl Into<String>, name: impl Into<String>, attempts: u32) -> Self {
        Self::NotReady {
            namespace: namespace.into(),
            name: name.into(),
            attempts,
        }
    }

    /// Create an invalid-secret error
    pub fn invalid_secret(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidSecret {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Classify a kube-rs error for a specific object.
    ///
    /// 404 becomes [`Error::NotFound`] and a 409 with reason `AlreadyExists`
    /// becomes [`Error::AlreadyExists`] so call sites can match on them. An
    /// update conflict (409 `Conflict`) and everything else is propagated.
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::already_exists(kind, name)
            }
            other => Self::Kube { source: other },
        }
    }

    /// True for [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for [`Error::AlreadyExists`]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}
