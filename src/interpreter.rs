use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::builtin::register_builtins;
use crate::command::{Command, CommandFactory, ExitCode, Sink};
use crate::config::ShellConfig;
use crate::context::{CommandContext, ContextParts};
use crate::error::{Result, ShellError};
use crate::io_adapters::ConsoleSink;
use crate::parser::{ArgumentVector, Parser};
use crate::process::{Pid, PipeSink, Pipeline, ProcessTable, Stage};
use crate::registry::{CommandRegistry, validate_arguments};
use crate::symbols::{MapSymbolTable, SymbolTable};
use crate::target::TargetRegistry;

/// State shared by the interpreter handles and, weakly, by every running stage.
pub(crate) struct Shared {
    registry: RwLock<CommandRegistry>,
    pub(crate) processes: ProcessTable,
    targets: TargetRegistry,
    symbols: Arc<dyn SymbolTable>,
    parser: Parser,
    should_exit: AtomicBool,
}

/// Outcome of a successfully started command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Blank line or comment.
    Empty,
    /// Every stage ran and was stopped.
    Completed,
    /// The pipeline keeps running in the background under this pid.
    Background(Pid),
}

/// An embeddable command interpreter with pipes, redirection and background pipelines.
///
/// The interpreter is a cheap handle: clones share the registry, the process table and
/// the redirection targets. Commands reach it through
/// [`CommandContext::interpreter`].
///
/// Example
/// ```
/// use emu_shell::{BufferSink, Interpreter};
/// use std::sync::Arc;
///
/// let sh = Interpreter::default();
/// let out = BufferSink::new();
/// let code = sh.execute_command("echo hello world", Arc::new(out.clone()), Arc::new(out.clone()));
/// assert_eq!(code, 0);
/// assert_eq!(out.lines(), vec!["hello world"]);
/// ```
#[derive(Clone)]
pub struct Interpreter {
    shared: Arc<Shared>,
}

impl Default for Interpreter {
    /// Interpreter with the built-in commands and an empty symbol table.
    fn default() -> Self {
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry);
        Self::new(registry, Arc::new(MapSymbolTable::new()))
    }
}

impl Interpreter {
    /// Create an interpreter with a custom set of commands.
    pub fn new(registry: CommandRegistry, symbols: Arc<dyn SymbolTable>) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(registry),
                processes: ProcessTable::new(),
                targets: TargetRegistry::default(),
                symbols,
                parser: Parser::default(),
                should_exit: AtomicBool::new(false),
            }),
        }
    }

    /// Interpreter with the built-in commands, configured script path and symbols.
    pub fn with_config(config: &ShellConfig) -> Self {
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry);
        registry.set_script_path(config.script_path.clone());
        let symbols: MapSymbolTable = config
            .symbols
            .iter()
            .map(|(name, address)| (name.clone(), *address))
            .collect();
        Self::new(registry, Arc::new(symbols))
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Register an additional command.
    pub fn register(&self, name: &str, factory: impl CommandFactory + 'static) {
        self.shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(name, factory);
    }

    /// Register an additional command created by a closure.
    pub fn register_with<F>(&self, name: &str, create: F)
    where
        F: Fn() -> Box<dyn Command> + Send + Sync + 'static,
    {
        self.shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_with(name, create);
    }

    /// Names of the registered commands, sorted.
    pub fn command_names(&self) -> Vec<String> {
        self.shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names()
    }

    /// Fresh instance of command `name` (registered or script).
    pub fn create_command(&self, name: &str) -> Result<Box<dyn Command>> {
        self.shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .create(name)
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.shared.processes
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.shared.targets
    }

    pub fn symbols(&self) -> &dyn SymbolTable {
        self.shared.symbols.as_ref()
    }

    /// Stop background pipeline `pid`. Returns `false` if there is none.
    pub fn kill(&self, pid: Pid) -> bool {
        self.shared.processes.kill(pid)
    }

    /// Ask the interactive loop to end after the current line.
    pub fn request_exit(&self) {
        self.shared.should_exit.store(true, Ordering::SeqCst);
    }

    pub fn should_exit(&self) -> bool {
        self.shared.should_exit.load(Ordering::SeqCst)
    }

    /// Kill every background pipeline and close every target.
    pub fn shutdown(&self) {
        self.shared.processes.kill_all();
        self.shared.targets.close_all();
    }

    fn resolve(&self, index: usize, args: &ArgumentVector) -> Result<Box<dyn Command>> {
        let name = args.first().map(String::as_str).unwrap_or_default();
        let command = self.create_command(name)?;
        validate_arguments(command.as_ref(), args)?;
        if index > 0 && !command.accepts_input() {
            return Err(ShellError::NoInput(name.to_string()));
        }
        Ok(command)
    }

    /// Parse, build and start a command line.
    ///
    /// Stages are started last to first so every stage is ready before the stage in
    /// front of it can produce output. A pipeline whose first stage is asynchronous is
    /// registered in the process table; anything else is finalized before returning.
    pub fn run_pipeline(&self, line: &str, out: Sink, err: Sink) -> Result<PipelineStatus> {
        let Some(parsed) = self.shared.parser.parse(line)? else {
            return Ok(PipelineStatus::Empty);
        };
        let command_line = parsed.to_string();
        let vectors = parsed.into_stages();

        let commands = vectors
            .iter()
            .enumerate()
            .map(|(index, args)| self.resolve(index, args))
            .collect::<Result<Vec<_>>>()?;

        let pid = commands
            .first()
            .is_some_and(|c| c.is_async())
            .then(|| self.shared.processes.allocate_pid());

        let mut stages = Vec::with_capacity(commands.len());
        let mut next_out = out;
        for (args, command) in vectors.into_iter().zip(commands).rev() {
            let ctx = CommandContext::new(ContextParts {
                args,
                command_line: command_line.clone(),
                pid,
                out: next_out,
                err: Arc::clone(&err),
                symbols: Arc::clone(&self.shared.symbols),
                shell: Arc::downgrade(&self.shared),
            });
            let stage = Arc::new(Stage::new(ctx, command));
            next_out = Arc::new(PipeSink::new(Arc::clone(&stage)));
            stages.push(stage);
        }
        stages.reverse();

        let pipeline = Arc::new(Pipeline::new(pid, command_line, stages));
        start(&pipeline)?;

        let registered = self
            .shared
            .processes
            .register_or_finalize(Arc::clone(&pipeline));
        Ok(match pipeline.pid() {
            Some(pid) if registered => PipelineStatus::Background(pid),
            _ => PipelineStatus::Completed,
        })
    }

    /// Run a command line, reporting any failure on `err`.
    ///
    /// Returns 0 on success, the failing stage's status if a stage failed to start and
    /// 1 for every other error.
    pub fn execute_command(&self, line: &str, out: Sink, err: Sink) -> ExitCode {
        match self.run_pipeline(line, out, Arc::clone(&err)) {
            Ok(_) => 0,
            Err(e) => {
                log::debug!("'{line}' failed: {e}");
                err.write_line(&e.to_string());
                match e {
                    ShellError::StartFailed { code, .. } => code,
                    _ => 1,
                }
            }
        }
    }

    /// Interactive loop on the terminal.
    ///
    /// Ends on end of input, interrupt or after the `exit` command. Background
    /// pipelines are killed on the way out.
    pub fn repl(&self, prompt: &str, history: Option<&Path>) -> rustyline::Result<()> {
        let mut rl = DefaultEditor::new()?;
        if let Some(path) = history {
            if let Err(e) = rl.load_history(path) {
                log::debug!("no history loaded from {}: {e}", path.display());
            }
        }
        let out: Sink = Arc::new(ConsoleSink::stdout());
        let err: Sink = Arc::new(ConsoleSink::stderr());

        while !self.should_exit() {
            match rl.readline(prompt) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        rl.add_history_entry(line.as_str())?;
                    }
                    self.execute_command(&line, Arc::clone(&out), Arc::clone(&err));
                }
                Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }
        }

        if let Some(path) = history {
            if let Err(e) = rl.save_history(path) {
                log::warn!("could not save history to {}: {e}", path.display());
            }
        }
        self.shutdown();
        Ok(())
    }
}

fn start(pipeline: &Pipeline) -> Result<()> {
    let stages = pipeline.stages();
    for (index, stage) in stages.iter().enumerate().rev() {
        let code = stage.start();
        if code != 0 {
            for later in &stages[index + 1..] {
                later.stop();
            }
            return Err(ShellError::StartFailed {
                name: stage.name().to_string(),
                code,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::io_adapters::BufferSink;
    use crate::parser::quote_argument;
    use crate::test_utils::{MemoryTargets, Probe, ProbeLog};
    use std::sync::Barrier;
    use std::thread;

    struct Harness {
        shell: Interpreter,
        log: ProbeLog,
        memory: MemoryTargets,
        out: BufferSink,
        err: BufferSink,
    }

    impl Harness {
        fn new() -> Self {
            let shell = Interpreter::default();
            let memory = MemoryTargets::default();
            shell.targets().register_factory("mem:", memory.clone());
            Self {
                shell,
                log: ProbeLog::default(),
                memory,
                out: BufferSink::new(),
                err: BufferSink::new(),
            }
        }

        fn probe(&self, name: &'static str, configure: fn(Probe) -> Probe) {
            let log = self.log.clone();
            self.shell
                .register_with(name, move || Box::new(configure(Probe::new(&log, name))));
        }

        fn run(&self, line: &str) -> Result<PipelineStatus> {
            self.shell
                .run_pipeline(line, Arc::new(self.out.clone()), Arc::new(self.err.clone()))
        }

        fn execute(&self, line: &str) -> ExitCode {
            self.shell
                .execute_command(line, Arc::new(self.out.clone()), Arc::new(self.err.clone()))
        }
    }

    fn plain(probe: Probe) -> Probe {
        probe
    }

    fn background(probe: Probe) -> Probe {
        probe.run_async(true)
    }

    #[test]
    fn test_stages_start_in_reverse_order() {
        let h = Harness::new();
        for name in ["a", "b", "c"] {
            h.probe(name, plain);
        }
        assert_eq!(h.run("a | b | c").unwrap(), PipelineStatus::Completed);
        assert_eq!(h.log.starts(), vec!["c", "b", "a"]);
        for name in ["a", "b", "c"] {
            assert_eq!(h.log.stops(name), 1);
        }
    }

    #[test]
    fn test_lines_flow_through_stages() {
        let h = Harness::new();
        h.probe("fwd", plain);
        assert_eq!(h.execute("echo one two | fwd | grep o"), 0);
        assert_eq!(h.log.lines("fwd"), vec!["one two"]);
        assert_eq!(h.out.lines(), vec!["one two"]);
    }

    #[test]
    fn test_start_failure_tears_down_later_stages() {
        let h = Harness::new();
        h.probe("a", plain);
        h.probe("fail", |p| p.start_code(3));
        h.probe("c", plain);

        match h.run("a | fail | c") {
            Err(ShellError::StartFailed { name, code }) => {
                assert_eq!(name, "fail");
                assert_eq!(code, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(h.log.starts(), vec!["c", "fail"]);
        assert_eq!(h.log.stops("c"), 1);
        assert_eq!(h.log.stops("fail"), 0);
        assert_eq!(h.log.stops("a"), 0);
    }

    #[test]
    fn test_resolution_errors_start_nothing() {
        let h = Harness::new();
        h.probe("a", plain);

        let err = h.run("a | nosuch").unwrap_err();
        assert_eq!(err.to_string(), "nosuch: command not found");
        let err = h.run("a | echo").unwrap_err();
        assert_eq!(err.to_string(), "echo does not take input");
        let err = h.run("a | | a").unwrap_err();
        assert_eq!(err.to_string(), "parse error: empty command");
        let err = h.run("a | kill").unwrap_err();
        assert_eq!(err.to_string(), "usage: kill <pid>");
        assert!(h.log.starts().is_empty());
    }

    #[test]
    fn test_stage_without_input_may_only_lead() {
        let h = Harness::new();
        h.probe("a", plain);
        h.probe("source_only", |p| p.without_input());

        let err = h.run("a | source_only").unwrap_err();
        assert!(matches!(err, ShellError::NoInput(ref name) if name == "source_only"));
        assert!(h.log.starts().is_empty());

        assert_eq!(h.run("source_only | a").unwrap(), PipelineStatus::Completed);
        assert_eq!(h.log.starts(), vec!["a", "source_only"]);
    }

    #[test]
    fn test_quoted_pipe_is_an_argument() {
        let h = Harness::new();
        assert_eq!(h.execute("echo \"a|b\""), 0);
        assert_eq!(h.out.lines(), vec!["a|b"]);
    }

    #[test]
    fn test_blank_and_comment_lines() {
        let h = Harness::new();
        assert_eq!(h.run("   ").unwrap(), PipelineStatus::Empty);
        assert_eq!(h.run("# echo nope").unwrap(), PipelineStatus::Empty);
        assert!(h.out.lines().is_empty());
    }

    #[test]
    fn test_file_redirect_truncates_then_appends() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let name = path.to_string_lossy().into_owned();
        let quoted = quote_argument(&name);

        assert_eq!(h.execute(&format!("echo foo > {quoted}")), 0);
        assert_eq!(h.execute(&format!("echo bar >> {quoted}")), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "foo\nbar\n");
        assert!(h.shell.targets().list().is_empty());
        assert!(h.err.lines().is_empty());
    }

    #[test]
    fn test_truncating_open_of_busy_target_fails() {
        let h = Harness::new();
        h.probe("tick", background);
        h.probe("other", plain);

        let status = h.run("tick > mem:log").unwrap();
        assert!(matches!(status, PipelineStatus::Background(_)));
        assert_eq!(h.execute("other > mem:log"), 1);
        assert!(
            h.err
                .contents()
                .contains("mem:log: already opened: can not overwrite")
        );
        assert!(!h.log.starts().contains(&"other".to_string()));

        assert_eq!(h.execute("echo shared >> mem:log"), 0);
        assert_eq!(h.memory.lines("mem:log"), vec!["shared"]);
    }

    #[test]
    fn test_kill_stops_background_pipeline_once() {
        let h = Harness::new();
        h.probe("tick", background);
        h.probe("fwd", plain);

        let PipelineStatus::Background(pid) = h.run("tick | fwd").unwrap() else {
            panic!("expected a background pipeline");
        };
        assert_eq!(h.log.stops("tick"), 0);
        let ps = h.shell.processes().list();
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].pid, pid);
        assert_eq!(ps[0].command_line, "tick | fwd");

        assert!(h.shell.kill(pid));
        assert_eq!(h.log.stops("tick"), 1);
        assert_eq!(h.log.stops("fwd"), 1);
        assert!(h.shell.processes().list().is_empty());
        assert!(!h.shell.kill(pid));
    }

    #[test]
    fn test_kill_command_reports_unknown_pid() {
        let h = Harness::new();
        assert_eq!(h.execute("kill 99"), 1);
        assert!(h.err.contents().contains("99"));
    }

    #[test]
    fn test_exit_during_start_finalizes_immediately() {
        let h = Harness::new();
        h.probe("once", |p| p.run_async(true).exit_on_start());

        assert_eq!(h.run("once").unwrap(), PipelineStatus::Completed);
        assert_eq!(h.log.stops("once"), 1);
        assert!(h.shell.processes().is_empty());
    }

    #[test]
    fn test_self_exit_after_registration_finalizes() {
        let h = Harness::new();
        h.probe("tick", background);

        let PipelineStatus::Background(pid) = h.run("tick").unwrap() else {
            panic!("expected a background pipeline");
        };
        h.log.context("tick").unwrap().exit(0);
        assert!(!h.shell.processes().contains(pid));
        assert_eq!(h.log.stops("tick"), 1);
    }

    #[test]
    fn test_concurrent_exit_and_kill_finalize_once() {
        for _ in 0..50 {
            let h = Harness::new();
            h.probe("tick", background);
            let PipelineStatus::Background(pid) = h.run("tick").unwrap() else {
                panic!("expected a background pipeline");
            };
            let ctx = h.log.context("tick").unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let exiting = {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ctx.exit(0);
                })
            };
            let killing = {
                let barrier = Arc::clone(&barrier);
                let shell = h.shell.clone();
                thread::spawn(move || {
                    barrier.wait();
                    shell.kill(pid);
                })
            };
            exiting.join().unwrap();
            killing.join().unwrap();

            assert_eq!(h.log.stops("tick"), 1);
            assert!(!h.shell.processes().contains(pid));
        }
    }

    #[test]
    fn test_fclose_kills_writers() {
        let h = Harness::new();
        h.probe("tick", background);

        let PipelineStatus::Background(pid) = h.run("tick > mem:t").unwrap() else {
            panic!("expected a background pipeline");
        };
        assert_eq!(h.shell.targets().list().len(), 1);
        assert_eq!(h.execute("fclose mem:t"), 0);
        assert!(!h.shell.processes().contains(pid));
        assert_eq!(h.log.stops("tick"), 1);
        assert!(h.shell.targets().list().is_empty());
        assert_eq!(h.memory.closed(), 1);
    }

    #[test]
    fn test_stage_killing_its_own_pipeline() {
        let h = Harness::new();
        h.probe("tick", background);

        let PipelineStatus::Background(pid) = h.run("tick | trig kill 1").unwrap() else {
            panic!("expected a background pipeline");
        };
        assert_eq!(pid, 1);
        h.log.context("tick").unwrap().println("go");
        assert!(!h.shell.processes().contains(pid));
        assert_eq!(h.log.stops("tick"), 1);
    }

    #[test]
    fn test_exit_command_requests_exit() {
        let h = Harness::new();
        assert!(!h.shell.should_exit());
        assert_eq!(h.execute("exit"), 0);
        assert!(h.shell.should_exit());
    }
}
