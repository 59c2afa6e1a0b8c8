use std::io;

use thiserror::Error;

use crate::state::Status;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid container id {0:?}")]
    InvalidId(String),

    #[error("container {0} does not exist")]
    NotFound(String),

    #[error("container {0} already exists")]
    AlreadyExists(String),

    #[error("container {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        actual: Status,
        expected: &'static str,
    },

    #[error("container {0} has no process")]
    MissingPid(String),

    #[error("unknown signal {0:?}")]
    UnknownSignal(String),

    #[error("process {0} does not exist")]
    ProcessLookup(i32),

    /// The record does not publish the annotation needed to attach.
    #[error("{what} not available, container state: {status}")]
    AttachUnavailable { what: &'static str, status: Status },

    #[error("bundle configuration: {0}")]
    Config(String),

    #[error("starter: {0}")]
    Starter(String),

    #[error("hook {path}: {reason}")]
    Hook { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
