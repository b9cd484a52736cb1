//! Error types for oracle runs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("{0}")]
    SpecValidation(String),

    #[error("{0}")]
    Resolution(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    UnsupportedOperation(String),

    #[error("{0}")]
    Capture(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("{0}")]
    Script(String),

    /// A step failure, carrying the zero-based index and op of the step.
    /// Displays as the inner message so traces keep the raw browser text.
    #[error("{source}")]
    Step {
        index: usize,
        op: String,
        #[source]
        source: Box<OracleError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = OracleError> = std::result::Result<T, E>;

impl OracleError {
    /// Attribute this error to a step. Already-attributed errors are left alone.
    pub fn at_step(self, index: usize, op: impl Into<String>) -> Self {
        match self {
            OracleError::Step { .. } => self,
            other => OracleError::Step {
                index,
                op: op.into(),
                source: Box::new(other),
            },
        }
    }

    /// Stable kind name of the underlying error, used in result diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            OracleError::SpecValidation(_) => "spec_validation",
            OracleError::Resolution(_) => "resolution",
            OracleError::Timeout(_) => "timeout",
            OracleError::UnsupportedOperation(_) => "unsupported_operation",
            OracleError::Capture(_) => "capture",
            OracleError::Navigation(_) => "navigation",
            OracleError::Browser(_) => "browser",
            OracleError::Script(_) => "script",
            OracleError::Step { source, .. } => source.kind(),
            OracleError::Io(_) => "io",
            OracleError::Json(_) => "json",
        }
    }

    pub fn step_index(&self) -> Option<usize> {
        match self {
            OracleError::Step { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn step_op(&self) -> Option<&str> {
        match self {
            OracleError::Step { op, .. } => Some(op),
            _ => None,
        }
    }

    /// Full description including step attribution.
    pub fn detail(&self) -> String {
        match self {
            OracleError::Step { index, op, source } => {
                format!("step {} ({}): {}", index, op, source.detail())
            }
            other => format!("{} error: {}", other.kind(), other),
        }
    }

    /// Map an error kind reported by a page script back to a variant.
    pub fn from_page(kind: &str, message: String) -> Self {
        match kind {
            "resolution" => OracleError::Resolution(message),
            "timeout" => OracleError::Timeout(message),
            "unsupported" => OracleError::UnsupportedOperation(message),
            "capture" => OracleError::Capture(message),
            _ => OracleError::Script(message),
        }
    }
}
