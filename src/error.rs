use thiserror::Error;

/// Errors surfaced by box lifecycle, remote execution and transfer operations.
///
/// Everything propagates to the caller; the library never downgrades a failure
/// to a warning and never decides process exit codes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{what} not found")]
    NotFound { what: String },

    /// The external manager command exited non-zero. Carries the combined
    /// stdout/stderr; partial output is not safe to parse.
    #[error("VBoxManage {command} failed:\n{output}")]
    Gateway { command: String, output: String },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("remote execution failed: {0}")]
    Execution(String),

    #[error("transfer failed with status {status}: {detail}")]
    Transfer { detail: String, status: u32 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
