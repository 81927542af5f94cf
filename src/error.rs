// Error taxonomy for reading, interpreting and re-expressing a running cluster.

use thiserror::Error;

/// Every failure aborts the invocation; none of them is retried internally.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// A required source object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// A pod has not been bound to a host yet; wait and re-run.
    #[error("pod '{pod}' is not scheduled to a node yet")]
    SchedulingIncomplete { pod: String },

    /// A claim is owned by a different node than the one mounting it.
    #[error("node {node}: claim '{claim}' {reason}")]
    NodeMismatch {
        node: usize,
        claim: String,
        reason: String,
    },

    /// A pod does not mount a volume for a claim template it must have.
    #[error("node {node}: pod '{pod}' mounts no claim for volume '{volume}'")]
    ClaimNotFound {
        node: usize,
        pod: String,
        volume: String,
    },

    /// A malformed flag or port value.
    #[error("cannot parse {flag}: {reason}")]
    Parse { flag: String, reason: String },

    /// A combination the target scheme cannot express.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("platform request failed: {0}")]
    Platform(#[from] kube::Error),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl MigrateError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        MigrateError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn parse(flag: impl Into<String>, reason: impl Into<String>) -> Self {
        MigrateError::Parse {
            flag: flag.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        MigrateError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;
