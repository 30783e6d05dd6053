//! Error types for the interpreter core.

use std::io;

use crate::command::ExitCode;

/// Malformed command lines, reported before any stage is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A pipe with nothing in front of it (`| grep x`, `a || b`, `a |`).
    #[error("empty command")]
    EmptyCommand,
    /// A second redirect operator on the same line.
    #[error("redirected twice")]
    RedirectedTwice,
    /// A pipe after the redirect operator.
    #[error("pipe can not follow redirection")]
    PipeAfterRedirect,
    /// The line ended inside a quote or right after a backslash.
    #[error("unexpected end of line")]
    UnexpectedEndOfLine,
    /// A redirect operator without a target name.
    #[error("no redirect target")]
    NoRedirectTarget,
}

/// Errors produced by the interpreter.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("{0}: command not found")]
    CommandNotFound(String),

    #[error("usage: {name} {usage}")]
    Usage { name: String, usage: String },

    #[error("{0} does not take input")]
    NoInput(String),

    #[error("{name}: exited with status {code}")]
    StartFailed { name: String, code: ExitCode },

    #[error("{0}: already opened: can not overwrite")]
    TargetConflict(String),

    #[error("{0}: no such target")]
    UnknownTarget(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ShellError>;
