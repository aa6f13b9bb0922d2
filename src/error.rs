//! Error types for the reconciliation core
//!
//! Errors carry enough context (resource kind, name, field) to be recorded
//! verbatim on a check's status message. The classifiers `is_conflict` and
//! `is_not_found` drive the requeue policy: conflicts are routine under
//! concurrent writers and never surface as failures.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status the API server returns on a resourceVersion mismatch
const STATUS_CONFLICT: u16 = 409;

/// HTTP status the API server returns for missing objects
const STATUS_NOT_FOUND: u16 = 404;

/// Main error type for reconciliation
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Namespaced name of the object
        name: String,
    },

    /// Optimistic concurrency failure raised outside of the kube client
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Namespaced name of the object
        name: String,
        /// Description of the conflict
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A document or object is malformed
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "metadata.name")
        field: Option<String>,
    },

    /// No REST mapping exists for a GroupVersionKind
    #[error("no resource mapping for {api_version}/{kind}")]
    Mapping {
        /// apiVersion of the unresolved kind
        api_version: String,
        /// The unresolved kind
        kind: String,
    },

    /// Controller wiring is incomplete; only raised at startup
    #[error("configuration error: {message}")]
    Config {
        /// Description of the missing or invalid setting
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for an object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for an object
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

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a mapping error for an unknown kind
    pub fn mapping(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::Mapping {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for optimistic concurrency failures
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube { source } => api_code(source) == Some(STATUS_CONFLICT),
            Error::Conflict { .. } => true,
            _ => false,
        }
    }

    /// True when the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube { source } => api_code(source) == Some(STATUS_NOT_FOUND),
            Error::NotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this error is worth retrying
    ///
    /// Validation, serialization and configuration errors need a spec or
    /// code change; retrying them only burns API calls.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match api_code(source) {
                Some(STATUS_CONFLICT) => true,
                Some(code) => !(400..500).contains(&code),
                None => true,
            },
            Error::NotFound { .. } => true,
            Error::Conflict { .. } => true,
            Error::Serialization { .. } => false,
            Error::Validation { .. } => false,
            Error::Mapping { .. } => true,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("simulated {}", reason),
            reason: reason.to_string(),
            code,
        }),
    }
}
