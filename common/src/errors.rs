// Error handling framework
// One enum per concern; binaries wrap these with anyhow context.

use thiserror::Error;

/// Configuration-time validation errors (policies, group bindings, cron strings)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Policy [{0}] already exists, skipping duplicate definition")]
    DuplicatePolicy(String),

    #[error("Unknown policy [{0}]")]
    UnknownPolicy(String),

    #[error("Attempted to add duplicate schedule for group [{0}]")]
    DuplicateGroupBinding(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

/// Soft, per-project resolution failures.
///
/// These are reported through the resolution callback and exclude the project
/// from the current pass; they never abort a pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    #[error("Bad schedule tag value")]
    BadScheduleTag,

    #[error("Scan branch can't be determined")]
    BranchUndetermined,

    #[error("Scan engines can't be determined")]
    EnginesUndetermined,

    #[error("Repository URL is not set")]
    RepoUrlMissing,

    #[error("Repository URL or primary branch is not set")]
    RepoMisconfigured,

    #[error("Catalog lookup failed: {0}")]
    Lookup(String),
}

/// Errors raised by the catalog transport
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Communication failure during {operation}: {reason}")]
    Communication { operation: String, reason: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Malformed response from {operation}: {reason}")]
    MalformedResponse { operation: String, reason: String },

    #[error("Unexpected status {status} from {operation}")]
    UnexpectedStatus { operation: String, status: u16 },
}

impl CatalogError {
    /// Authentication failures are configuration problems, not transient ones
    pub fn is_fatal(&self) -> bool {
        matches!(self, CatalogError::Authentication(_))
    }
}

/// Trigger artifact persistence errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to write trigger file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove trigger file {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list trigger directory {path}: {source}")]
    List {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Scan gate errors. Lock contention is not an error, see `GateOutcome::Busy`.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Lock backend error: {0}")]
    Lock(String),

    #[error("Lock file error: {0}")]
    LockFile(#[from] std::io::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Scan submission rejected for project {project_id}: {reason}")]
    SubmissionRejected { project_id: String, reason: String },
}

impl From<redis::RedisError> for GateError {
    fn from(err: redis::RedisError) -> Self {
        GateError::Lock(err.to_string())
    }
}

/// Failure of one refresh pass
#[derive(Error, Debug)]
pub enum PassError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl PassError {
    /// Communication failures retry sooner than configuration failures
    pub fn is_transient(&self) -> bool {
        match self {
            PassError::Catalog(e) => !e.is_fatal(),
            PassError::Persistence(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "expected 5 fields".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_resolution_failure_reasons() {
        assert_eq!(
            ResolutionFailure::BadScheduleTag.to_string(),
            "Bad schedule tag value"
        );
        assert_eq!(
            ResolutionFailure::BranchUndetermined.to_string(),
            "Scan branch can't be determined"
        );
        assert_eq!(
            ResolutionFailure::RepoUrlMissing.to_string(),
            "Repository URL is not set"
        );
    }

    #[test]
    fn test_authentication_is_fatal() {
        assert!(CatalogError::Authentication("bad secret".to_string()).is_fatal());
        let comm = CatalogError::Communication {
            operation: "get_projects".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(!comm.is_fatal());
        assert!(PassError::from(comm).is_transient());
    }
}
