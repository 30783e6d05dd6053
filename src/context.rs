use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context as _, anyhow};

use crate::command::{ExitCode, Sink};
use crate::interpreter::{Interpreter, Shared};
use crate::parser::ArgumentVector;
use crate::process::Pid;
use crate::symbols::{MapSymbolTable, SymbolTable};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Execution environment of one pipeline stage.
///
/// Holds the stage's resolved arguments, its output and error sinks, the shared symbol
/// table, the pipeline's process id (if the pipeline runs in the background) and a weak
/// handle back to the interpreter for nested command execution and self-exit.
///
/// Cloning is cheap and every clone refers to the same stage; asynchronous commands move
/// a clone into their background task.
#[derive(Clone)]
pub struct CommandContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    args: ArgumentVector,
    command_line: String,
    pid: Option<Pid>,
    out: Sink,
    err: Sink,
    symbols: Arc<dyn SymbolTable>,
    shell: Weak<Shared>,
    exited: AtomicBool,
}

/// Everything the executor knows about a stage before it exists.
pub(crate) struct ContextParts {
    pub args: ArgumentVector,
    pub command_line: String,
    pub pid: Option<Pid>,
    pub out: Sink,
    pub err: Sink,
    pub symbols: Arc<dyn SymbolTable>,
    pub shell: Weak<Shared>,
}

impl CommandContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                args: parts.args,
                command_line: parts.command_line,
                pid: parts.pid,
                out: parts.out,
                err: parts.err,
                symbols: parts.symbols,
                shell: parts.shell,
                exited: AtomicBool::new(false),
            }),
        }
    }

    /// A context that is not attached to any interpreter.
    ///
    /// Useful for running a single command directly. Nested execution fails and
    /// [`CommandContext::exit`] only records the exit.
    pub fn standalone(args: ArgumentVector, out: Sink, err: Sink) -> Self {
        let command_line = crate::parser::join_arguments(&args);
        Self::new(ContextParts {
            args,
            command_line,
            pid: None,
            out,
            err,
            symbols: Arc::new(MapSymbolTable::new()),
            shell: Weak::new(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The name the command was invoked as.
    pub fn command_name(&self) -> &str {
        self.inner.args.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments after the command name.
    pub fn arguments(&self) -> &[String] {
        self.inner.args.get(1..).unwrap_or_default()
    }

    pub fn argument_count(&self) -> usize {
        self.arguments().len()
    }

    /// Argument `index`, not counting the command name.
    pub fn argument(&self, index: usize) -> Option<&str> {
        self.arguments().get(index).map(String::as_str)
    }

    /// Parse argument `index` into `T`.
    pub fn argument_as<T>(&self, index: usize) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self
            .argument(index)
            .ok_or_else(|| anyhow!("missing argument {}", index + 1))?;
        raw.parse::<T>()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("illegal argument '{raw}'"))
    }

    /// The full line of the pipeline this stage belongs to.
    pub fn command_line(&self) -> &str {
        &self.inner.command_line
    }

    /// Process id shared by all stages of a background pipeline.
    pub fn pid(&self) -> Option<Pid> {
        self.inner.pid
    }

    pub fn out(&self) -> &Sink {
        &self.inner.out
    }

    pub fn err(&self) -> &Sink {
        &self.inner.err
    }

    /// Write a line to the output sink.
    pub fn println(&self, line: impl AsRef<str>) {
        self.inner.out.write_line(line.as_ref());
    }

    /// Write a line to the error sink.
    pub fn eprintln(&self, line: impl AsRef<str>) {
        self.inner.err.write_line(line.as_ref());
    }

    pub fn symbols(&self) -> &dyn SymbolTable {
        self.inner.symbols.as_ref()
    }

    /// The interpreter running this stage, if it is still alive.
    pub fn interpreter(&self) -> Option<Interpreter> {
        self.inner.shell.upgrade().map(Interpreter::from_shared)
    }

    /// Execute another command line with this stage's output and error sinks.
    ///
    /// Runs on the calling thread: nested synchronous pipelines complete before this
    /// returns.
    pub fn execute_command(&self, line: &str) -> ExitCode {
        match self.interpreter() {
            Some(shell) => shell.execute_command(line, self.out().clone(), self.err().clone()),
            None => {
                self.eprintln(format!("{}: no interpreter to run '{line}'", self.command_name()));
                1
            }
        }
    }

    /// Signal that this stage is done producing output.
    ///
    /// Only the first call has an effect. For a background pipeline whose other stages
    /// are finished as well this finalizes the whole pipeline.
    pub fn exit(&self, code: ExitCode) {
        if self.inner.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!(
            "{} (pid {:?}) exited with status {code}",
            self.command_name(),
            self.pid()
        );
        if let (Some(pid), Some(shell)) = (self.pid(), self.inner.shell.upgrade()) {
            shell.processes.notify_exit(pid);
        }
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }
}
