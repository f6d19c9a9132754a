use std::{error::Error, fmt, io};

use machine_learning::MlErr;
use tokio::task::JoinError;

/// The federation module's result type.
pub type Result<T> = std::result::Result<T, FederationErr>;

/// Failures of the federation client, its collaborators and the local simulation.
#[derive(Debug)]
pub enum FederationErr {
    Io(io::Error),
    Ml(MlErr),
    Json(serde_json::Error),
    Join(JoinError),
    Config(String),
    Device(String),
    Unsupported(&'static str),
    MissingShardDescriptor,
    EmptyRegistry,
    DuplicateTask(String),
    UnknownTask(String),
    UnknownCollaborator(String),
    InvalidHeader {
        field: &'static str,
        got: String,
        expected: String,
    },
    UnexpectedMessage {
        expected: &'static str,
        got: String,
    },
    /// An error reported by the other end of a link.
    Remote(String),
    ModelSizeMismatch {
        got: usize,
        expected: usize,
    },
    RoundMismatch {
        got: usize,
        expected: usize,
    },
    Aggregation(&'static str),
    ExperimentFailed(String),
    NotStarted,
}

impl fmt::Display for FederationErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Ml(e) => write!(f, "training error: {e}"),
            Self::Json(e) => write!(f, "invalid json: {e}"),
            Self::Join(e) => write!(f, "task failed to complete: {e}"),
            Self::Config(msg) => write!(f, "invalid config: {msg}"),
            Self::Device(msg) => write!(f, "device error: {msg}"),
            Self::Unsupported(what) => write!(f, "{what} is not supported"),
            Self::MissingShardDescriptor => write!(f, "no shard descriptor was set"),
            Self::EmptyRegistry => write!(f, "the shard registry is empty"),
            Self::DuplicateTask(name) => write!(f, "a task named '{name}' is already registered"),
            Self::UnknownTask(name) => write!(f, "no task named '{name}' is registered"),
            Self::UnknownCollaborator(name) => write!(f, "'{name}' is not part of the experiment"),
            Self::InvalidHeader {
                field,
                got,
                expected,
            } => write!(
                f,
                "invalid message header {field}: got '{got}', expected '{expected}'"
            ),
            Self::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message: expected {expected}, got {got}")
            }
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
            Self::ModelSizeMismatch { got, expected } => {
                write!(f, "model size mismatch: got {got}, expected {expected}")
            }
            Self::RoundMismatch { got, expected } => {
                write!(f, "round mismatch: got {got}, expected {expected}")
            }
            Self::Aggregation(msg) => write!(f, "aggregation error: {msg}"),
            Self::ExperimentFailed(name) => write!(f, "experiment '{name}' failed"),
            Self::NotStarted => write!(f, "the experiment was not started"),
        }
    }
}

impl Error for FederationErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Ml(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Join(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FederationErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for FederationErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<serde_json::Error> for FederationErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<JoinError> for FederationErr {
    fn from(value: JoinError) -> Self {
        Self::Join(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<FederationErr> for io::Error {
    fn from(value: FederationErr) -> Self {
        match value {
            FederationErr::Io(e) => e,
            FederationErr::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
