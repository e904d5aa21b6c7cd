use crate::CmdId;
use std::io;
use thiserror::Error;

/// Errors produced by the lush process core.
#[derive(Debug, Error)]
pub enum LushError {
    #[error("command already started")]
    AlreadyStarted,

    #[error("command not started")]
    NotStarted,

    #[error("command is not running")]
    NotRunning,

    #[error("command is still running")]
    StillRunning,

    #[error("command has been released")]
    Released,

    #[error("argv must not be empty")]
    EmptyArgv,

    #[error("no sink configured")]
    NoSink,

    #[error("stream closed")]
    StreamClosed,

    #[error("command not found: {0}")]
    CommandNotFound(CmdId),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Exit(#[from] ExitError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

pub type LushResult<T> = Result<T, LushError>;

/// Why a command ended unsuccessfully. Stored in its status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExitError {
    /// The process could not be spawned at all.
    #[error("failed to launch {program}: {message}")]
    Launch {
        program: String,
        kind: io::ErrorKind,
        message: String,
    },

    #[error("exit status {0}")]
    Code(i32),

    #[error("terminated by signal {0}")]
    Signal(i32),

    /// Output could not be delivered (every sink went away).
    #[error("output stream failed: {0}")]
    Stream(String),

    #[error("wait failed: {0}")]
    Wait(String),
}

impl ExitError {
    pub(crate) fn launch(program: &str, err: &io::Error) -> Self {
        ExitError::Launch {
            program: program.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<LushError> for io::Error {
    fn from(e: LushError) -> Self {
        match e {
            LushError::Io(e) => e,
            LushError::StreamClosed | LushError::Released => {
                io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
            }
            other => io::Error::other(other.to_string()),
        }
    }
}
