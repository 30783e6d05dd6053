use std::sync::Arc;

use crate::context::CommandContext;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// There is no distinguished "crashed" code: unexpected failures inside a command are
/// caught by the executor and reported as 1.
pub type ExitCode = i32;

/// Destination for lines of output.
///
/// Every pipeline stage writes through two sinks (output and error). A sink may be the
/// console, an in-memory buffer, the input of the next stage, or a redirect target.
/// Sinks are shared between threads: asynchronous stages keep writing from their own
/// background threads after their start call returned.
pub trait LineSink: Send + Sync {
    /// Deliver one line (without trailing newline).
    fn write_line(&self, line: &str);
}

/// Shared handle to a [`LineSink`].
pub type Sink = Arc<dyn LineSink>;

/// Object-safe trait for any command that can be bound to a pipeline stage.
///
/// A fresh instance is created for every invocation, so implementors may keep
/// per-invocation state in `self`.
///
/// Optional capabilities:
/// - line input: [`Command::accepts_input`] + [`Command::line_read`]; required for every
///   stage that receives the output of a previous stage;
/// - asynchronous execution: [`Command::is_async`] + [`Command::stop`]; an asynchronous
///   command may keep producing output after [`Command::execute`] returned, and ends
///   either through `stop` or by calling [`CommandContext::exit`] itself.
pub trait Command: Send {
    /// One-line description for `help`.
    fn help(&self) -> &str;

    /// Argument synopsis using `<required>` and `[optional]` markup.
    ///
    /// Every `<` marks one required argument and is checked before execution.
    fn argument_help(&self) -> &str {
        ""
    }

    /// Start the command.
    ///
    /// Synchronous commands do all their work here. Asynchronous commands only set up
    /// and launch their background work. Return value follows shell conventions.
    fn execute(&mut self, ctx: &CommandContext) -> anyhow::Result<ExitCode>;

    /// Whether this command can consume piped lines.
    fn accepts_input(&self) -> bool {
        false
    }

    /// Consume one line of piped input.
    fn line_read(&mut self, _line: &str) {}

    /// Whether this command keeps running after `execute` returned.
    fn is_async(&self) -> bool {
        false
    }

    /// Stop the command and release what it holds (subprocesses, timers, targets).
    ///
    /// Called at most once per invocation, possibly from another thread than the one
    /// that started the command. Requests termination of background work, does not wait
    /// for it.
    fn stop(&mut self, _ctx: &CommandContext) {}
}

/// Creates fresh [`Command`] instances for a registered name.
pub trait CommandFactory: Send + Sync {
    fn create(&self) -> Box<dyn Command>;
}
