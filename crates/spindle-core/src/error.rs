// Error taxonomy shared across the spindle

use thiserror::Error;

/// Vault operation errors
#[derive(Debug, Error)]
pub enum VaultError {
    /// A secret already exists for this (repo, key) pair
    #[error("key already present")]
    KeyAlreadyPresent,

    /// No secret exists for this (repo, key) pair
    #[error("key not found")]
    KeyNotFound,

    /// Key does not match the identifier grammar
    #[error("invalid key identifier: {0:?}")]
    InvalidKeyIdent(String),

    /// Backend failure (connection, serialization, ...)
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl VaultError {
    /// Wrap a backend failure with context
    pub fn backend(msg: impl Into<String>) -> Self {
        VaultError::Backend(anyhow::anyhow!(msg.into()))
    }
}

/// Step execution errors surfaced by an engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow deadline fired while the step was running
    #[error("workflow timed out")]
    TimedOut,

    /// The container was killed by the kernel OOM killer
    #[error("out of memory")]
    OomKilled,

    /// The step command exited non-zero
    #[error("workflow failed with exit code {exit_code}")]
    WorkflowFailed { exit_code: i64 },

    /// Anything else (daemon errors, image pull failures, ...)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn failed(exit_code: i64) -> Self {
        EngineError::WorkflowFailed { exit_code }
    }

    /// Exit code to record in the status event, if the error carries one
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            EngineError::WorkflowFailed { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Closed set of error tags used in XRPC envelopes and diagnostics
///
/// Every error that crosses a service boundary is labeled with exactly one
/// of these; the string forms are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    MissingActorDid,
    Auth,
    InvalidRepo,
    AccessControl,
    KeyAlreadyPresent,
    KeyNotFound,
    InvalidKeyIdent,
    MissingEngine,
    WorkflowSkipped,
    InvalidConfiguration,
    TimedOut,
    OomKilled,
    WorkflowFailed,
    Generic,
}

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::MissingActorDid => "MissingActorDid",
            ErrorTag::Auth => "Auth",
            ErrorTag::InvalidRepo => "InvalidRepo",
            ErrorTag::AccessControl => "AccessControl",
            ErrorTag::KeyAlreadyPresent => "KeyAlreadyPresent",
            ErrorTag::KeyNotFound => "KeyNotFound",
            ErrorTag::InvalidKeyIdent => "InvalidKeyIdent",
            ErrorTag::MissingEngine => "MissingEngine",
            ErrorTag::WorkflowSkipped => "WorkflowSkipped",
            ErrorTag::InvalidConfiguration => "InvalidConfiguration",
            ErrorTag::TimedOut => "ErrTimedOut",
            ErrorTag::OomKilled => "ErrOOMKilled",
            ErrorTag::WorkflowFailed => "ErrWorkflowFailed",
            ErrorTag::Generic => "Generic",
        }
    }
}

impl From<&VaultError> for ErrorTag {
    fn from(err: &VaultError) -> Self {
        match err {
            VaultError::KeyAlreadyPresent => ErrorTag::KeyAlreadyPresent,
            VaultError::KeyNotFound => ErrorTag::KeyNotFound,
            VaultError::InvalidKeyIdent(_) => ErrorTag::InvalidKeyIdent,
            VaultError::Backend(_) => ErrorTag::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_exit_code() {
        assert_eq!(EngineError::failed(137).exit_code(), Some(137));
        assert_eq!(EngineError::TimedOut.exit_code(), None);
        assert_eq!(EngineError::OomKilled.exit_code(), None);
    }

    #[test]
    fn test_vault_error_tags() {
        assert_eq!(
            ErrorTag::from(&VaultError::KeyAlreadyPresent).as_str(),
            "KeyAlreadyPresent"
        );
        assert_eq!(
            ErrorTag::from(&VaultError::backend("boom")).as_str(),
            "Generic"
        );
    }
}
