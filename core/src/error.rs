use thiserror::Error;

/// Shared error type for loom-core. Mirrors the teacher's `CodexErr`:
/// one flat enum per crate rather than per-module error types, so callers
/// deep in the pipeline can bubble up with a single `?`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("queue file {path} has a non-canonical shape: {reason}")]
    MalformedQueueFile { path: String, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("unresolved reference: {0}")]
    UnresolvedRef(String),

    #[error("parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("missing required tool for verb {verb}")]
    MissingTool { verb: String },

    #[error("ai provider error: {0}")]
    AiProvider(String),

    #[error("ai request timed out after {0:?}")]
    AiTimeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, CoreError>;
