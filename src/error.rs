use std::{io, path::PathBuf, time::Duration};

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("{0}")]
    PreconditionNotMet(String),
    #[error("{tool} exited with {}: {stderr}", describe_status(.status))]
    ExternalTool {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("Error downloading file: {0}")]
    Network(#[from] Box<ureq::Error>),
    #[error("{tool} timed out after {} seconds", .after.as_secs())]
    Timeout { tool: String, after: Duration },
    #[error("{0}")]
    StructuralValidation(String),
    #[error("IO error at {path:?}: {source}")]
    Filesystem { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error("Error parsing environment: {0}")]
    Config(#[from] json5::Error),
    #[error("Error serializing report: {0}")]
    Json(#[from] serde_json::Error),
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

impl From<ureq::Error> for ProvisionError {
    fn from(value: ureq::Error) -> Self {
        Self::Network(Box::new(value))
    }
}

/// Coarse classification used by callers that decide whether to halt or retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PreconditionNotMet,
    ExternalToolFailure,
    NetworkFailure,
    TimeoutFailure,
    StructuralValidationFailure,
    FilesystemFailure,
    ConfigFailure,
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PreconditionNotMet(_) => ErrorKind::PreconditionNotMet,
            Self::ExternalTool { .. } => ErrorKind::ExternalToolFailure,
            Self::Network(_) => ErrorKind::NetworkFailure,
            Self::Timeout { .. } => ErrorKind::TimeoutFailure,
            Self::StructuralValidation(_) => ErrorKind::StructuralValidationFailure,
            Self::Filesystem { .. } | Self::Io(_) | Self::Zip(_) => ErrorKind::FilesystemFailure,
            Self::Config(_) | Self::Json(_) => ErrorKind::ConfigFailure,
        }
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionNotMet(msg.into())
    }
}

/// Attach the offending path to an IO error
pub(crate) trait PathContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T, ProvisionError>;
}

impl<T> PathContext<T> for Result<T, io::Error> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T, ProvisionError> {
        self.map_err(|source| ProvisionError::Filesystem {
            path: path.into(),
            source,
        })
    }
}
