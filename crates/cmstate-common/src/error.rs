//! Error types for the CMState injector
//!
//! Errors carry the kind and name of the object involved so that logs and
//! admission denials say which record failed. The store classifies raw API
//! errors into [`Error::NotFound`], [`Error::Conflict`] and
//! [`Error::AlreadyExists`] so callers can match on intent instead of HTTP
//! status codes.

use thiserror::Error;

/// Main error type for CMState operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is not one of the classified cases below
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Resource kind (e.g., "CMState")
        kind: String,
        /// Resource name
        name: String,
    },

    /// Optimistic-concurrency collision (stale resourceVersion)
    #[error("conflict updating {kind} '{name}': {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Message returned by the API server
        message: String,
    },

    /// Create raced with another writer that created the same object
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// The CMTemplate a group references is not known
    #[error("cmtemplate '{template}' not found")]
    TemplateMissing {
        /// Name of the missing template
        template: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The admission request could not be interpreted
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of what's wrong with the request
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "reconciler", "webhook")
        context: String,
    },
}

impl Error {
    /// Classify a kube error for the given object.
    ///
    /// 404 becomes [`Error::NotFound`]; 409 becomes [`Error::AlreadyExists`]
    /// when the API server says so and [`Error::Conflict`] otherwise.
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: ae.message,
            },
            other => Self::Kube { source: other },
        }
    }

    /// Create a conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

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

    /// Create a template-missing error
    pub fn template_missing(template: impl Into<String>) -> Self {
        Self::TemplateMissing {
            template: template.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an invalid-request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
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

    /// True when the object was absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for an optimistic-concurrency collision
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True when another writer got there first (conflict or lost create race).
    ///
    /// These are the errors worth one immediate retry after re-reading state.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::AlreadyExists { .. })
    }

    /// Check if this error is worth retrying with backoff
    ///
    /// A missing template or a malformed request needs a human; everything
    /// store-related may resolve by itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429
            ),
            Error::NotFound { .. } => true,
            Error::Conflict { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::TemplateMissing { .. } => false,
            Error::Serialization { .. } => false,
            Error::InvalidRequest { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for errors caused by store unavailability rather than by state
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube { .. } => self.is_retryable(),
            Error::Internal { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_not_found() {
        let err = Error::from_kube("CMState", "cmstate-vault", api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert!(err.to_string().contains("cmstate-vault"));
    }

    #[test]
    fn classifies_already_exists_separately_from_conflict() {
        let err = Error::from_kube("CMState", "x", api_error(409, "AlreadyExists"));
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert!(err.is_contention());
        assert!(!err.is_conflict());

        let err = Error::from_kube("CMState", "x", api_error(409, "Conflict"));
        assert!(err.is_conflict());
        assert!(err.is_contention());
    }

    #[test]
    fn other_api_errors_stay_kube_errors() {
        let err = Error::from_kube("CMState", "x", api_error(500, "InternalError"));
        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.is_retryable());
        assert!(err.is_transient());

        let err = Error::from_kube("CMState", "x", api_error(403, "Forbidden"));
        assert!(!err.is_retryable());
        assert!(!err.is_transient());
    }

    #[test]
    fn throttling_is_retryable() {
        let err = Error::from_kube("ConfigMap", "x", api_error(429, "TooManyRequests"));
        assert!(err.is_retryable());
    }

    #[test]
    fn template_missing_needs_operator_attention() {
        let err = Error::template_missing("vault-agent");
        assert!(!err.is_retryable());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "cmtemplate 'vault-agent' not found");
    }

    #[test]
    fn serde_errors_convert() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_error_carries_context() {
        let err = Error::internal_with_context("reconciler", "unexpected state");
        assert!(err.to_string().contains("[reconciler]"));
        assert!(err.is_transient());
    }
}
