use thiserror::Error;

/// Failures reported by a table provider, classified by the provider's error code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("restore time outside the recoverable window: {0}")]
    InvalidRestoreTime(String),

    #[error("resource is in use: {0}")]
    InUse(String),

    #[error("provider error: {0}")]
    Transient(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::InUse(_))
    }
}

/// Object storage and document errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("document {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("document {0} could not be encoded: {1}")]
    Encode(String, #[source] serde_json::Error),

    #[error("document {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("object storage error: {0}")]
    Backend(String),
}

/// Top level error for the jobs' library code.
#[derive(Debug, Error)]
pub enum BnrError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no backup recorded for table {0}")]
    NoBackupFound(String),

    #[error("parameter {0} not found")]
    ParameterNotFound(String),

    #[error("parameter store error: {0}")]
    Parameter(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BnrError {
    /// True for every "this thing does not exist" condition, wherever it came from.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_not_found(),
            Self::Store(StoreError::NotFound(_)) => true,
            Self::NoBackupFound(_) | Self::ParameterNotFound(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = BnrError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(BnrError::from(ProviderError::NotFound("t".into())).is_not_found());
        assert!(BnrError::from(StoreError::NotFound("k".into())).is_not_found());
        assert!(BnrError::NoBackupFound("t".into()).is_not_found());
        assert!(!BnrError::from(ProviderError::InUse("t".into())).is_not_found());
        assert!(!BnrError::Config("missing".into()).is_not_found());
    }

    #[test]
    fn test_error_messages() {
        let err = ProviderError::AlreadyExists("restored_orders".into());
        assert_eq!(err.to_string(), "resource already exists: restored_orders");

        let err = BnrError::from(StoreError::ConcurrentModification("metadata.json".into()));
        assert_eq!(
            err.to_string(),
            "document metadata.json was modified concurrently"
        );
    }
}
