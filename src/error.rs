//! Error types for the Atlas controller
//!
//! Errors carry the resource kind and name they concern so a failed reconcile
//! can be traced back to a specific object. Kubernetes API failures are
//! classified once, at the client boundary, into the categories the
//! reconcile loop acts on (not found, conflict, already exists, transient).

use thiserror::Error;

/// Main error type for Atlas operations
#[derive(Debug, Error)]
pub enum Error {
    /// Unclassified Kubernetes client error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The object was deleted (or never existed)
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (AtlasApp, Deployment, Service)
        kind: String,
        /// namespace/name of the object
        name: String,
    },

    /// Optimistic-concurrency clash: the object changed since it was read
    #[error("conflict updating {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// namespace/name of the object
        name: String,
        /// API server message
        message: String,
    },

    /// Create raced with another writer
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// namespace/name of the object
        name: String,
    },

    /// Network or API server failure that may succeed on a later attempt
    #[error("{kind} {name}: {message}")]
    Transient {
        /// Resource kind
        kind: String,
        /// namespace/name of the object
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration or spec
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// An operation exceeded its deadline
    #[error("{operation} timed out")]
    Timeout {
        /// Name of the operation that timed out
        operation: String,
    },

    /// Shutdown was requested while the operation was in flight
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Catalog synchronization failure
    #[error("catalog error: {message}")]
    Catalog {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Classify a kube-rs error for the given object
    ///
    /// 404 becomes `NotFound`, 409 `AlreadyExists` becomes `AlreadyExists`,
    /// any other 409 is a `Conflict`, and everything else is `Transient`.
    pub fn from_kube(kind: impl Into<String>, name: impl Into<String>, err: kube::Error) -> Self {
        let kind = kind.into();
        let name = name.into();
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound { kind, name },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists { kind, name }
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                kind,
                name,
                message: ae.message,
            },
            other => Self::Transient {
                kind,
                name,
                message: other.to_string(),
            },
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a transient error
    pub fn transient(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Transient {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a catalog error with the given message
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for optimistic-concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason != "AlreadyExists",
            _ => false,
        }
    }

    /// True when the object is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation errors need a spec or config change.
    /// Cancellation means the process is shutting down.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::Transient { .. } => true,
            Error::Validation { .. } => false,
            Error::Timeout { .. } => true,
            Error::Cancelled => false,
            Error::Catalog { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}
