//! An embeddable command interpreter for driving an emulated CPU and its peripherals.
//!
//! Lines are parsed into pipelines of commands (`a | b | c > target`). Every command is
//! a [`Command`] trait object created fresh from a [`CommandRegistry`] for each
//! invocation. Commands either complete during their start call or keep running in the
//! background as asynchronous processes, listed by `ps` and stopped by `kill` or by
//! exiting themselves.
//!
//! The main entry point is [`Interpreter`]. The public modules [`command`] and
//! [`context`] expose what is needed to implement your own commands; [`target`] lets
//! an embedder plug in additional redirection sinks.

mod builtin;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
mod external;
mod interpreter;
mod io_adapters;
pub mod parser;
mod process;
mod registry;
pub mod symbols;
pub mod target;
pub mod task;

#[cfg(test)]
mod test_utils;

pub use builtin::register_builtins;
pub use command::{Command, CommandFactory, ExitCode, LineSink, Sink};
pub use config::ShellConfig;
pub use context::CommandContext;
pub use error::{ParseError, Result, ShellError};
pub use external::find_program;
pub use interpreter::{Interpreter, PipelineStatus};
pub use io_adapters::{BufferSink, ConsoleSink, NullSink};
pub use process::{Pid, ProcessInfo, ProcessTable};
pub use registry::{CommandRegistry, Factory};
pub use symbols::{MapSymbolTable, SymbolTable};
pub use target::{TargetRegistry, TargetSink};
