use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by the composition, projection and adaptation engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed protocol: {}", .0.join("; "))]
    MalformedProtocol(Vec<String>),

    #[error("incompatible interface: {}", .0.join("; "))]
    IncompatibleInterface(Vec<String>),

    #[error("subscription is not well-formed: {}", .0.join("; "))]
    NotWellFormed(Vec<String>),

    #[error("machine does not conform to projection: {}", .0.join("; "))]
    NonConformant(Vec<String>),

    #[error("adaptation failed: {0}")]
    Adaptation(String),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("refusing to overwrite {0}: file was not generated by swarm-conformance")]
    ForeignFile(PathBuf),

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),
}

impl Error {
    /// The individual messages carried by the error, one per violation.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Error::MalformedProtocol(errors)
            | Error::IncompatibleInterface(errors)
            | Error::NotWellFormed(errors)
            | Error::NonConformant(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
