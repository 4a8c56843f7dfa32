//! Typed error kinds and error handling helpers and primitives.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Chain creates a string from an error stack.
pub fn chain(res: anyhow::Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// Validation-layer failures (C9). Short-circuits before any backend dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Bundle parsing failures (C1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BundleError {
    #[error("bundle not found at {0}")]
    NotFound(PathBuf),

    #[error("config.json missing beneath {0}")]
    ConfigMissing(PathBuf),

    #[error("config.json malformed: {0}")]
    ConfigMalformed(String),

    #[error("unsupported spec version {0}, expected >= 1.0.0")]
    UnsupportedSpecVersion(String),

    #[error("bundle validation failed: {0}")]
    ValidationFailed(String),

    #[error("rootfs missing at {0}")]
    RootfsMissing(PathBuf),
}

/// State-store failures (C8).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("no record for container {0}")]
    RecordMissing(String),

    #[error("container {id} is in status {status}, expected {expected}")]
    WrongStatus {
        id: String,
        status: String,
        expected: String,
    },

    #[error("lock contention on container {0}")]
    LockContention(String),

    #[error("container {0} already exists")]
    AlreadyExists(String),
}

/// Backend adapter failures (C3/C4/C5).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("oci runtime library call {op} failed: {message}")]
    LibraryError { op: String, message: String },

    #[error("command failed with exit code {exit}: {stderr}")]
    CliFailed { stderr: String, exit: i32 },

    #[error("backend tool not installed")]
    NotInstalled,

    #[error("remote call failed: {0}")]
    RemoteFailed(String),

    #[error("hook {path} failed: {reason}")]
    HookFailed { path: String, reason: String },
}

/// The top-level error type matched by the CLI driver to pick an exit code.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Maps an error to the process exit code documented for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Validation(_) => 2,
            RuntimeError::NotFound(_) => 3,
            RuntimeError::Bundle(BundleError::NotFound(_)) => 3,
            RuntimeError::State(StateError::RecordMissing(_)) => 3,
            RuntimeError::State(StateError::WrongStatus { .. }) => 4,
            RuntimeError::State(StateError::AlreadyExists(_)) => 4,
            RuntimeError::Bundle(_) => 1,
            RuntimeError::State(_) => 1,
            RuntimeError::Backend(BackendError::NotInstalled) => 127,
            RuntimeError::PermissionDenied(_) => 126,
            RuntimeError::Backend(_) => 125,
            RuntimeError::Auth(_) => 125,
            RuntimeError::Timeout(_) => 125,
            RuntimeError::Internal(_) => 125,
        }
    }

    /// The `<kind>` token used in `error[<kind>]: <message>` stderr lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Validation(_) => "ValidationError",
            RuntimeError::Bundle(_) => "BundleError",
            RuntimeError::State(_) => "StateError",
            RuntimeError::Backend(_) => "BackendError",
            RuntimeError::Auth(_) => "AuthError",
            RuntimeError::PermissionDenied(_) => "PermissionDenied",
            RuntimeError::NotFound(_) => "NotFound",
            RuntimeError::Timeout(_) => "Timeout",
            RuntimeError::Internal(_) => "Internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain_joins_causes() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn exit_codes_match_cli_surface() {
        assert_eq!(
            RuntimeError::Validation(ValidationError::new("id", "too long")).exit_code(),
            2
        );
        assert_eq!(
            RuntimeError::Bundle(BundleError::NotFound("/tmp".into())).exit_code(),
            3
        );
        assert_eq!(
            RuntimeError::State(StateError::WrongStatus {
                id: "a".into(),
                status: "running".into(),
                expected: "created".into(),
            })
            .exit_code(),
            4
        );
        assert_eq!(
            RuntimeError::Backend(BackendError::NotInstalled).exit_code(),
            127
        );
        assert_eq!(RuntimeError::PermissionDenied("x".into()).exit_code(), 126);
    }

    #[test]
    fn kind_names_match_spec_taxonomy() {
        assert_eq!(
            RuntimeError::Validation(ValidationError::new("id", "bad")).kind(),
            "ValidationError"
        );
        assert_eq!(RuntimeError::Auth("no token".into()).kind(), "AuthError");
    }
}
