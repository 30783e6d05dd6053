use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};
use regex::{Regex, RegexBuilder};

use crate::command::{Command, ExitCode, Sink};
use crate::context::CommandContext;
use crate::external::Exec;
use crate::interpreter::Interpreter;
use crate::parser::{RedirectMode, join_arguments};
use crate::registry::{CommandRegistry, Factory};
use crate::target::Target;
use crate::task::BackgroundTask;

/// Register the built-in command bundle.
pub fn register_builtins(registry: &mut CommandRegistry) {
    registry.register("help", Factory::<Help>::default());
    registry.register("ps", Factory::<Ps>::default());
    registry.register("kill", Factory::<Kill>::default());
    registry.register("echo", Factory::<Echo>::default());
    registry.register("grep", Factory::<Grep>::default());
    registry.register("timestamp", Factory::<Timestamp>::default());
    registry.register("trig", Factory::<Trig>::default());
    registry.register("source", Factory::<Source>::default());
    registry.register("repeat", Factory::<Repeat>::default());
    registry.register("exec", Factory::<Exec>::default());
    registry.register("symbol", Factory::<Symbol>::default());
    registry.register("files", Factory::<Files>::default());
    registry.register("fclose", Factory::<Fclose>::default());
    registry.register("exit", Factory::<Exit>::default());
    registry.register("quit", Factory::<Exit>::default());
    for mode in [RedirectMode::Truncate, RedirectMode::Append] {
        registry.register_with(mode.operator(), move || Box::new(RedirectCommand::new(mode)));
    }
}

/// Parse the stage's arguments with argh.
///
/// On `--help` or invalid arguments argh's output is written to the context and the
/// status to return from `execute` is handed back as the error.
fn parse_args<T: FromArgs>(ctx: &CommandContext) -> std::result::Result<T, ExitCode> {
    let args: Vec<&str> = ctx.arguments().iter().map(String::as_str).collect();
    T::from_args(&[ctx.command_name()], &args).map_err(|EarlyExit { output, status }| {
        let is_error = status.is_err();
        for line in output.lines() {
            if is_error {
                ctx.eprintln(line);
            } else {
                ctx.println(line);
            }
        }
        if is_error { 1 } else { 0 }
    })
}

fn interpreter(ctx: &CommandContext) -> Result<Interpreter> {
    ctx.interpreter().context("not attached to an interpreter")
}

#[derive(FromArgs)]
/// Show the available commands, or describe one.
struct HelpArgs {
    #[argh(positional)]
    /// command to describe
    command: Option<String>,
}

#[derive(Default)]
pub struct Help;

impl Command for Help {
    fn help(&self) -> &str {
        "show help for the specified command or command list"
    }

    fn argument_help(&self) -> &str {
        "[command]"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let args = match parse_args::<HelpArgs>(ctx) {
            Ok(args) => args,
            Err(code) => return Ok(code),
        };
        let shell = interpreter(ctx)?;
        if let Some(name) = args.command {
            let command = shell.create_command(&name)?;
            ctx.println(format!("{name} {}", command.argument_help()).trim_end());
            ctx.println(format!("  {}", command.help()));
            return Ok(0);
        }
        for name in shell.command_names() {
            let command = shell.create_command(&name)?;
            let synopsis = format!("{name} {}", command.argument_help());
            ctx.println(format!("{:<40}{}", synopsis.trim_end(), command.help()));
        }
        Ok(0)
    }
}

#[derive(Default)]
pub struct Ps;

impl Command for Ps {
    fn help(&self) -> &str {
        "list current executing commands/processes"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let shell = interpreter(ctx)?;
        ctx.println("  PID\tCommand");
        for process in shell.processes().list() {
            ctx.println(format!("  {}\t{}", process.pid, process.command_line));
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Kill a background pipeline.
struct KillArgs {
    #[argh(positional)]
    /// process id as listed by ps
    pid: u32,
}

#[derive(Default)]
pub struct Kill;

impl Command for Kill {
    fn help(&self) -> &str {
        "kill a currently executing command"
    }

    fn argument_help(&self) -> &str {
        "<pid>"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let args = match parse_args::<KillArgs>(ctx) {
            Ok(args) => args,
            Err(code) => return Ok(code),
        };
        if !interpreter(ctx)?.kill(args.pid) {
            ctx.eprintln(format!("could not find the command to kill: {}", args.pid));
            return Ok(1);
        }
        Ok(0)
    }
}

/// Print the arguments separated by single spaces.
#[derive(Default)]
pub struct Echo;

impl Command for Echo {
    fn help(&self) -> &str {
        "echo arguments"
    }

    fn argument_help(&self) -> &str {
        "[arg ...]"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        ctx.println(ctx.arguments().join(" "));
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Forward lines matching a regular expression.
struct GrepArgs {
    #[argh(switch, short = 'i')]
    /// ignore case distinctions
    ignore_case: bool,

    #[argh(switch, short = 'v')]
    /// forward the lines that do not match
    invert_match: bool,

    #[argh(switch, short = 'w')]
    /// match only whole words (using non-word characters as boundaries)
    word_regexp: bool,

    #[argh(positional)]
    /// the pattern to search for (a regular expression)
    pattern: String,
}

#[derive(Default)]
pub struct Grep {
    pattern: Option<Regex>,
    invert_match: bool,
    out: Option<Sink>,
}

impl Command for Grep {
    fn help(&self) -> &str {
        "print lines matching the specified pattern"
    }

    fn argument_help(&self) -> &str {
        "[-i] [-v] [-w] <regexp>"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let args = match parse_args::<GrepArgs>(ctx) {
            Ok(args) => args,
            Err(code) => return Ok(code),
        };
        let pattern = if args.word_regexp {
            format!(r"\b({})\b", args.pattern)
        } else {
            args.pattern
        };
        let re = RegexBuilder::new(&pattern)
            .case_insensitive(args.ignore_case)
            .build()
            .with_context(|| format!("invalid regex pattern: {pattern}"))?;
        self.pattern = Some(re);
        self.invert_match = args.invert_match;
        self.out = Some(ctx.out().clone());
        Ok(0)
    }

    fn accepts_input(&self) -> bool {
        true
    }

    fn line_read(&mut self, line: &str) {
        if let (Some(re), Some(out)) = (&self.pattern, &self.out) {
            if re.is_match(line) != self.invert_match {
                out.write_line(line);
            }
        }
    }
}

/// Prefix every input line with the wall clock time in milliseconds.
#[derive(Default)]
pub struct Timestamp {
    out: Option<Sink>,
}

impl Command for Timestamp {
    fn help(&self) -> &str {
        "print lines prefixed with timestamp as milliseconds"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        self.out = Some(ctx.out().clone());
        Ok(0)
    }

    fn accepts_input(&self) -> bool {
        true
    }

    fn line_read(&mut self, line: &str) {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        if let Some(out) = &self.out {
            out.write_line(&format!("{millis} {line}"));
        }
    }
}

/// Run a command line for every input line.
#[derive(Default)]
pub struct Trig {
    command_line: String,
    ctx: Option<CommandContext>,
}

impl Command for Trig {
    fn help(&self) -> &str {
        "trigger command when getting input"
    }

    fn argument_help(&self) -> &str {
        "<command line>"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        self.command_line = join_arguments(ctx.arguments());
        self.ctx = Some(ctx.clone());
        Ok(0)
    }

    fn accepts_input(&self) -> bool {
        true
    }

    fn line_read(&mut self, _line: &str) {
        if let Some(ctx) = &self.ctx {
            ctx.execute_command(&self.command_line);
        }
    }

    fn stop(&mut self, _ctx: &CommandContext) {
        self.ctx = None;
    }
}

/// Execute every line of a script file in order.
pub(crate) fn run_script(ctx: &CommandContext, path: &Path, verbose: bool) -> Result<ExitCode> {
    let file = File::open(path)
        .with_context(|| format!("could not find the script file '{}'", path.display()))?;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("error reading '{}'", path.display()))?;
        if verbose {
            ctx.println(&line);
        }
        ctx.execute_command(&line);
    }
    Ok(0)
}

#[derive(FromArgs)]
/// Run a script.
struct SourceArgs {
    #[argh(switch, short = 'v')]
    /// print every line before running it
    verbose: bool,

    #[argh(positional)]
    /// script to run
    filename: PathBuf,
}

#[derive(Default)]
pub struct Source;

impl Command for Source {
    fn help(&self) -> &str {
        "run script"
    }

    fn argument_help(&self) -> &str {
        "[-v] <filename>"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let args = match parse_args::<SourceArgs>(ctx) {
            Ok(args) => args,
            Err(code) => return Ok(code),
        };
        run_script(ctx, &args.filename, args.verbose)
    }
}

/// A script found on the script path, invoked by its name.
pub(crate) struct ScriptCommand {
    path: PathBuf,
}

impl ScriptCommand {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Command for ScriptCommand {
    fn help(&self) -> &str {
        "run script"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        run_script(ctx, &self.path, false)
    }
}

const DEFAULT_REPEAT_PERIOD: Duration = Duration::from_secs(1);

#[derive(FromArgs)]
/// Re-run a command line periodically in the background.
struct RepeatArgs {
    #[argh(option, short = 't')]
    /// seconds between runs
    delay: Option<f64>,

    #[argh(option, short = 'c')]
    /// number of runs, 0 repeats forever
    count: Option<u64>,

    #[argh(positional)]
    /// command line to run, usually quoted
    command_line: String,
}

/// Re-run a command line periodically in the background.
#[derive(Default)]
pub struct Repeat {
    command_line: String,
    task: Option<BackgroundTask>,
}

impl Command for Repeat {
    fn help(&self) -> &str {
        "repeat the specified command line"
    }

    fn argument_help(&self) -> &str {
        "[-t delay] [-c count] <command line>"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let RepeatArgs {
            delay,
            count,
            command_line,
        } = match parse_args::<RepeatArgs>(ctx) {
            Ok(args) => args,
            Err(code) => return Ok(code),
        };
        let period = match delay {
            Some(seconds) => Duration::try_from_secs_f64(seconds)
                .with_context(|| format!("illegal delay: {seconds}"))?,
            None => DEFAULT_REPEAT_PERIOD,
        };
        let count = count.filter(|&c| c > 0);
        self.command_line = command_line.clone();

        let ctx = ctx.clone();
        let task = BackgroundTask::spawn("repeat", move |token| {
            let mut runs = 0;
            while !token.sleep(period) {
                runs += 1;
                ctx.execute_command(&command_line);
                if count.is_some_and(|max| runs >= max) {
                    ctx.exit(0);
                    break;
                }
            }
        })?;
        self.task = Some(task);
        Ok(0)
    }

    fn is_async(&self) -> bool {
        true
    }

    fn stop(&mut self, ctx: &CommandContext) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
        ctx.eprintln(format!("[repeat exit: {}]", self.command_line));
        ctx.exit(0);
    }
}

#[derive(FromArgs)]
/// List symbols matching a regular expression.
struct SymbolArgs {
    #[argh(positional)]
    /// regular expression to match symbol names against
    pattern: String,
}

#[derive(Default)]
pub struct Symbol;

impl Command for Symbol {
    fn help(&self) -> &str {
        "list matching symbols"
    }

    fn argument_help(&self) -> &str {
        "<regexp>"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let args = match parse_args::<SymbolArgs>(ctx) {
            Ok(args) => args,
            Err(code) => return Ok(code),
        };
        let re = Regex::new(&args.pattern)
            .with_context(|| format!("invalid regex pattern: {}", args.pattern))?;
        let matching: Vec<(String, u32)> = ctx
            .symbols()
            .entries()
            .into_iter()
            .filter(|(name, _)| re.is_match(name))
            .collect();
        if matching.is_empty() {
            ctx.eprintln(format!(
                "could not find any symbols matching '{}'",
                args.pattern
            ));
        }
        for (name, address) in matching {
            ctx.println(format!(" {name} at ${address:04x}"));
        }
        Ok(0)
    }
}

/// List the open redirection targets.
#[derive(Default)]
pub struct Files;

impl Command for Files {
    fn help(&self) -> &str {
        "list open files"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        for target in interpreter(ctx)?.targets().list() {
            ctx.println(format!("  {}\t{} writer(s)", target.name, target.writers));
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Close a redirection target and kill the pipelines writing into it.
struct FcloseArgs {
    #[argh(positional)]
    /// target to close
    target: String,
}

#[derive(Default)]
pub struct Fclose;

impl Command for Fclose {
    fn help(&self) -> &str {
        "close the specified file"
    }

    fn argument_help(&self) -> &str {
        "<target>"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let args = match parse_args::<FcloseArgs>(ctx) {
            Ok(args) => args,
            Err(code) => return Ok(code),
        };
        let shell = interpreter(ctx)?;
        shell
            .targets()
            .force_close(&args.target, shell.processes())?;
        Ok(0)
    }
}

/// Leave the interactive loop.
#[derive(Default)]
pub struct Exit;

impl Command for Exit {
    fn help(&self) -> &str {
        "exit the shell"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        interpreter(ctx)?.request_exit();
        Ok(0)
    }
}

/// The trailing `>`/`>>` stage of a redirected pipeline.
pub(crate) struct RedirectCommand {
    mode: RedirectMode,
    target: Option<Weak<Target>>,
    ctx: Option<CommandContext>,
}

impl RedirectCommand {
    pub(crate) fn new(mode: RedirectMode) -> Self {
        Self {
            mode,
            target: None,
            ctx: None,
        }
    }
}

impl Command for RedirectCommand {
    fn help(&self) -> &str {
        match self.mode {
            RedirectMode::Truncate => "redirect output to a target, replacing its contents",
            RedirectMode::Append => "redirect output to a target, appending to it",
        }
    }

    fn argument_help(&self) -> &str {
        "<target>"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let name = ctx.argument(0).context("no redirect target")?;
        let append = self.mode == RedirectMode::Append;
        let target = interpreter(ctx)?.targets().open(name, append, ctx)?;
        self.target = Some(Arc::downgrade(&target));
        self.ctx = Some(ctx.clone());
        Ok(0)
    }

    fn accepts_input(&self) -> bool {
        true
    }

    /// A failed write detaches from the target and exits the stage with status 1.
    fn line_read(&mut self, line: &str) {
        let Some(target) = self.target.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let Err(e) = target.write_line(line) else {
            return;
        };
        self.target = None;
        if let Some(ctx) = &self.ctx {
            ctx.eprintln(format!("{}: write failed: {e}", target.name()));
            if let Some(shell) = ctx.interpreter() {
                shell.targets().detach(&target, ctx);
            }
            ctx.exit(1);
        }
    }

    fn stop(&mut self, ctx: &CommandContext) {
        let target = self.target.take().and_then(|t| t.upgrade());
        if let (Some(target), Some(shell)) = (target, ctx.interpreter()) {
            shell.targets().detach(&target, ctx);
        }
    }
}
