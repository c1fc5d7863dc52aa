//! The error type shared by every part of the engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A child shares its parent's host but not its SSH port, so it is unclear whether a hop is
    /// needed.
    #[error("{node} shares host {host} with its parent but uses port {port} instead of {parent_port}")]
    AddressConflict {
        node: String,
        host: String,
        port: u16,
        parent_port: u16,
    },

    /// The credential was rejected or the host could not be reached.
    #[error("could not open session ({step}): exit code {code}")]
    SessionOpenFailure { step: String, code: i32 },

    /// A command inside a session exited with a non-zero status.
    #[error("session body failed ({step}): {status}")]
    SessionBodyFailure { step: String, status: String },

    #[error("transfer did not complete ({step}): {status}")]
    TransferFailure { step: String, status: String },

    #[error("{operation} requires a {required} deployment, but the deployment is {actual}")]
    StateViolation {
        operation: String,
        required: String,
        actual: String,
    },

    /// Session delimiters were reused or closed out of order. This is a bug in the plan builder.
    #[error("session delimiter misuse: {0}")]
    DelimiterCollision(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("invalid address for {node}: {reason}")]
    InvalidAddress { node: String, reason: String },

    #[error("invalid artifact {artifact}: {reason}")]
    InvalidArtifact { artifact: String, reason: String },

    #[error("password store {}: {reason}", path.display())]
    PasswordStore { path: PathBuf, reason: String },

    #[error("no configuration payload for {node}: {reason}")]
    MissingPayload { node: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[cfg(feature = "openssh")]
    #[error(transparent)]
    Ssh(#[from] openssh::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
