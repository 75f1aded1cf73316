//! Quarry error abstractions.

use thiserror::Error;

/// Error variants surfaced by the convergence engine.
///
/// Not-found on dependent objects never appears here: absence is modelled as `Option::None` by
/// the client layer and is treated as "create" or "nothing to tear down" by callers.
#[derive(Debug, Error)]
pub enum Error {
    /// An error returned from the Kubernetes API which has no more specific classification.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    /// An optimistic concurrency write was rejected because the object changed underneath us.
    #[error("write conflict on {kind} {name}")]
    Conflict { kind: String, name: String },
    /// An object which must exist for the requested write does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    /// A call did not complete before its deadline.
    #[error("timeout while {0}")]
    Timeout(String),
    /// A dependency of the current step is not yet ready.
    #[error("dependency not ready: {0}")]
    NotReady(String),
    /// The administrative channel to the frontend tier could not be established.
    #[error("administrative channel unavailable: {0}")]
    AdminChannel(String),
    /// A critical upgrade hook failed.
    #[error("hook {hook} failed: {reason}")]
    HookFailed { hook: String, reason: String },
    /// Operator runtime configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An object could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The operator has hit an internal error, but will remain online.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if this error is expected to resolve on its own given a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Timeout(_) | Self::NotReady(_) | Self::AdminChannel(_) => true,
            Self::Kube(kube::Error::Api(err)) => err.code == 429 || err.code >= 500,
            Self::Kube(kube::Error::HyperError(_)) | Self::Kube(kube::Error::Service(_)) => true,
            _ => false,
        }
    }
}

/// A result type where the error is a Quarry `Error`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
