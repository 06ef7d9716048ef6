use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the conversion and export pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed signature, missing default key, bad version number and the like.
    /// Always raised before anything is written.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("tensor not found in graph: {0}")]
    TensorNotFound(String),

    #[error("unsupported operator {op} (node {node:?})")]
    UnsupportedOp { op: String, node: String },

    #[error("unsupported artifact for {frontend}: {artifact}")]
    UnsupportedArtifact { frontend: String, artifact: String },

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("bundle version already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
