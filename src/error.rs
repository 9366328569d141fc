//! Error types for the PaV agents and plugins.

use thiserror::Error;

/// Main error type for PaV operations.
///
/// Variants map onto the failure kinds of the volume lifecycle: schema and
/// template errors are user errors that are not retried until the
/// provisioner object changes, phase failures carry the worker pod's
/// diagnostics, and Kubernetes errors are retried with backoff.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The provisioner object violates the schema
    #[error("schema error: {0}")]
    Schema(String),

    /// Template evaluation failed
    #[error("template error: {0}")]
    Template(String),

    /// A capacity quantity could not be parsed
    #[error("invalid quantity: {0}")]
    Quantity(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A phase exceeded its time bound
    #[error("{0} timed out")]
    Timeout(crate::worker::Phase),

    /// The object an operation was pinned to was replaced by a new instance
    /// with the same name
    #[error("{0} object was replaced")]
    ObjectReplaced(&'static str),

    /// An invariant the orchestrator is expected to uphold did not hold
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a schema error with the given message
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error is a transient orchestrator error that should be
    /// retried with backoff rather than surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Kube(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<crate::template::TemplateError> for Error {
    fn from(err: crate::template::TemplateError) -> Self {
        Self::Template(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Phase;

    #[test]
    fn transient_classification_only_covers_kube_errors() {
        assert!(!Error::schema("bad spec").is_transient());
        assert!(!Error::template("undefined variable").is_transient());
        assert!(!Error::Timeout(Phase::Staging).is_transient());
    }

    #[test]
    fn timeout_display_names_the_phase() {
        assert_eq!(
            Error::Timeout(Phase::Unstaging).to_string(),
            "unstaging timed out"
        );
    }

    #[test]
    fn replaced_objects_name_their_kind() {
        assert_eq!(
            Error::ObjectReplaced("PersistentVolumeClaim").to_string(),
            "PersistentVolumeClaim object was replaced"
        );
    }
}
