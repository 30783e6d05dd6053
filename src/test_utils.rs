//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use crate::command::{Command, ExitCode, Sink};
use crate::context::{CommandContext, ContextParts};
use crate::io_adapters::NullSink;
use crate::process::Pid;
use crate::symbols::MapSymbolTable;
use crate::target::{TargetFactory, TargetSink};

/// Context detached from any interpreter.
pub(crate) fn context(args: &[&str], pid: Option<Pid>, out: Sink) -> CommandContext {
    CommandContext::new(ContextParts {
        args: args.iter().map(|s| s.to_string()).collect(),
        command_line: args.join(" "),
        pid,
        out,
        err: Arc::new(NullSink),
        symbols: Arc::new(MapSymbolTable::new()),
        shell: std::sync::Weak::new(),
    })
}

/// Ordered record of what probes did.
#[derive(Clone, Default)]
pub(crate) struct ProbeLog {
    events: Arc<Mutex<Vec<String>>>,
    contexts: Arc<Mutex<HashMap<String, CommandContext>>>,
}

impl ProbeLog {
    fn record(&self, event: String) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Context of the last started probe called `name`.
    pub(crate) fn context(&self, name: &str) -> Option<CommandContext> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the started probes, in start order.
    pub(crate) fn starts(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix("start:").map(str::to_string))
            .collect()
    }

    pub(crate) fn stops(&self, name: &str) -> usize {
        let event = format!("stop:{name}");
        self.events().iter().filter(|e| **e == event).count()
    }

    pub(crate) fn lines(&self, name: &str) -> Vec<String> {
        let prefix = format!("line:{name}:");
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect()
    }
}

/// Command that records its lifecycle into a [`ProbeLog`].
///
/// Forwards input lines to its output, so probes can be chained.
pub(crate) struct Probe {
    log: ProbeLog,
    name: String,
    is_async: bool,
    accepts_input: bool,
    start_code: ExitCode,
    exit_on_start: bool,
    out: Option<Sink>,
}

impl Probe {
    pub(crate) fn new(log: &ProbeLog, name: &str) -> Self {
        Self {
            log: log.clone(),
            name: name.to_string(),
            is_async: false,
            accepts_input: true,
            start_code: 0,
            exit_on_start: false,
            out: None,
        }
    }

    pub(crate) fn run_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub(crate) fn without_input(mut self) -> Self {
        self.accepts_input = false;
        self
    }

    pub(crate) fn start_code(mut self, code: ExitCode) -> Self {
        self.start_code = code;
        self
    }

    /// Call `exit` from inside `execute`.
    pub(crate) fn exit_on_start(mut self) -> Self {
        self.exit_on_start = true;
        self
    }
}

impl Command for Probe {
    fn help(&self) -> &str {
        "records what happens to it"
    }

    fn execute(&mut self, ctx: &CommandContext) -> anyhow::Result<ExitCode> {
        self.log.record(format!("start:{}", self.name));
        self.log
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.name.clone(), ctx.clone());
        self.out = Some(ctx.out().clone());
        if self.exit_on_start {
            ctx.exit(0);
        }
        Ok(self.start_code)
    }

    fn accepts_input(&self) -> bool {
        self.accepts_input
    }

    fn line_read(&mut self, line: &str) {
        self.log.record(format!("line:{}:{line}", self.name));
        if let Some(out) = &self.out {
            out.write_line(line);
        }
    }

    fn is_async(&self) -> bool {
        self.is_async
    }

    fn stop(&mut self, _ctx: &CommandContext) {
        self.log.record(format!("stop:{}", self.name));
    }
}

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, Vec<String>>,
    created: usize,
    closed: usize,
}

/// Target factory keeping target contents in memory.
#[derive(Clone, Default)]
pub(crate) struct MemoryTargets {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTargets {
    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn created(&self) -> usize {
        self.with_state(|s| s.created)
    }

    pub(crate) fn closed(&self) -> usize {
        self.with_state(|s| s.closed)
    }

    pub(crate) fn lines(&self, name: &str) -> Vec<String> {
        self.with_state(|s| s.files.get(name).cloned().unwrap_or_default())
    }
}

struct MemorySink {
    name: String,
    targets: MemoryTargets,
}

impl TargetSink for MemorySink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.targets.with_state(|s| {
            s.files
                .entry(self.name.clone())
                .or_default()
                .push(line.to_string())
        });
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.targets.with_state(|s| s.closed += 1);
        Ok(())
    }
}

impl TargetFactory for MemoryTargets {
    fn create(&self, name: &str, append: bool) -> io::Result<Box<dyn TargetSink>> {
        self.with_state(|s| {
            s.created += 1;
            let lines = s.files.entry(name.to_string()).or_default();
            if !append {
                lines.clear();
            }
        });
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            targets: self.clone(),
        }))
    }
}
