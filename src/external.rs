//! `exec`: run a host program as a pipeline stage.

use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, ChildStdin, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::command::{Command, ExitCode, Sink};
use crate::context::CommandContext;
use crate::task::BackgroundTask;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Locate `program` the way a shell would.
///
/// A bare name is looked up in every directory of `search_paths` (PATH syntax). Anything
/// with a directory part, absolute or relative, is taken as it is.
pub fn find_program(search_paths: &OsStr, program: &Path) -> Option<PathBuf> {
    let mut components = program.components();
    match (components.next(), components.next()) {
        (None, _) => None,
        (Some(Component::Normal(name)), None) => std::env::split_paths(search_paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file()),
        _ => program.is_file().then(|| program.to_path_buf()),
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> ExitCode {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> ExitCode {
    status.code().unwrap_or(-1)
}

/// Kill and reap a child whose stage failed to start.
fn abandon(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::warn!("exec: could not kill {}: {e}", child.id());
    }
    if let Err(e) = child.wait() {
        log::warn!("exec: could not reap {}: {e}", child.id());
    }
}

fn forward_lines(
    name: &str,
    pipe: impl Read + Send + 'static,
    sink: Sink,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        for line in BufReader::new(pipe).lines().map_while(std::io::Result::ok) {
            sink.write_line(&line);
        }
    })
}

/// Runs a host program in the background.
///
/// The program's standard output and error are forwarded line by line, piped input
/// lines go to its standard input. The stage exits with the program's status; stopping
/// the stage kills the program.
#[derive(Default)]
pub struct Exec {
    child: Option<Arc<Mutex<Child>>>,
    stdin: Option<ChildStdin>,
    waiter: Option<BackgroundTask>,
    ctx: Option<CommandContext>,
}

impl Command for Exec {
    fn help(&self) -> &str {
        "execute the specified program"
    }

    fn argument_help(&self) -> &str {
        "<program> [args...]"
    }

    fn execute(&mut self, ctx: &CommandContext) -> Result<ExitCode> {
        let program = ctx.argument(0).context("missing program")?;
        let search_paths = std::env::var_os("PATH").unwrap_or_default();
        let executable = find_program(&search_paths, Path::new(program))
            .with_context(|| format!("could not find program '{program}'"))?;

        let mut child = std::process::Command::new(&executable)
            .args(&ctx.arguments()[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not start '{}'", executable.display()))?;
        log::debug!("exec: started {} (os pid {})", executable.display(), child.id());

        let forwarding = (|| -> std::io::Result<Vec<JoinHandle<()>>> {
            let mut readers = Vec::new();
            if let Some(stdout) = child.stdout.take() {
                readers.push(forward_lines("exec-stdout", stdout, ctx.out().clone())?);
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(forward_lines("exec-stderr", stderr, ctx.err().clone())?);
            }
            Ok(readers)
        })();
        let readers = match forwarding {
            Ok(readers) => readers,
            Err(e) => {
                abandon(&mut child);
                return Err(e).context("could not forward program output");
            }
        };
        let stdin = child.stdin.take();

        let child = Arc::new(Mutex::new(child));
        let watched = Arc::clone(&child);
        let waiter_ctx = ctx.clone();
        let waiter = BackgroundTask::spawn("exec-wait", move |token| {
            let ctx = waiter_ctx;
            loop {
                let status = watched
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .try_wait();
                match status {
                    Ok(Some(status)) => {
                        for reader in readers {
                            if reader.join().is_err() {
                                log::warn!("exec: output forwarder panicked");
                            }
                        }
                        ctx.exit(exit_code(status));
                        return;
                    }
                    Ok(None) => {
                        if token.sleep(EXIT_POLL_INTERVAL) {
                            return;
                        }
                    }
                    Err(e) => {
                        ctx.eprintln(format!("exec: {e}"));
                        ctx.exit(1);
                        return;
                    }
                }
            }
        });
        let waiter = match waiter {
            Ok(waiter) => waiter,
            Err(e) => {
                abandon(&mut child.lock().unwrap_or_else(PoisonError::into_inner));
                return Err(e).context("could not watch program");
            }
        };
        self.stdin = stdin;
        self.waiter = Some(waiter);
        self.child = Some(child);
        self.ctx = Some(ctx.clone());
        Ok(0)
    }

    fn accepts_input(&self) -> bool {
        true
    }

    /// A failed write to the program's input exits the stage with status 1.
    fn line_read(&mut self, line: &str) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(stdin, "{line}").and_then(|()| stdin.flush()) {
            self.stdin = None;
            if let Some(ctx) = &self.ctx {
                ctx.eprintln(format!("exec: {e}"));
                ctx.exit(1);
            }
        }
    }

    fn is_async(&self) -> bool {
        true
    }

    fn stop(&mut self, _ctx: &CommandContext) {
        self.stdin = None;
        if let Some(waiter) = self.waiter.take() {
            waiter.cancel();
        }
        if let Some(child) = self.child.take() {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill() {
                    log::warn!("exec: could not kill {}: {e}", child.id());
                }
                if let Err(e) = child.wait() {
                    log::warn!("exec: could not reap {}: {e}", child.id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::interpreter::{Interpreter, PipelineStatus};
        use crate::io_adapters::BufferSink;
        use std::time::Instant;

        fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !condition() {
                if Instant::now() > deadline {
                    return false;
                }
                thread::sleep(Duration::from_millis(5));
            }
            true
        }

        fn start(shell: &Interpreter, line: &str) -> (PipelineStatus, BufferSink, BufferSink) {
            let out = BufferSink::new();
            let err = BufferSink::new();
            let status = shell
                .run_pipeline(line, Arc::new(out.clone()), Arc::new(err.clone()))
                .unwrap();
            (status, out, err)
        }

        #[test]
        fn absolute_existing() {
            let found = find_program(OsStr::new("/nowhere"), Path::new("/bin/sh"));
            assert_eq!(found.as_deref(), Some(Path::new("/bin/sh")));
        }

        #[test]
        fn absolute_missing() {
            assert!(find_program(OsStr::new("/bin"), Path::new("/bin/nonexisting")).is_none());
        }

        #[test]
        fn bare_name_is_searched() {
            let found = find_program(OsStr::new("/nowhere:/bin"), Path::new("sh")).unwrap();
            assert_eq!(found, Path::new("/bin/sh"));
            assert!(find_program(OsStr::new("/bin"), Path::new("nonexisting")).is_none());
        }

        #[test]
        fn empty_name_is_none() {
            assert!(find_program(OsStr::new("/bin"), Path::new("")).is_none());
        }

        #[test]
        fn directories_are_not_programs() {
            let dir = tempfile::tempdir().unwrap();
            assert!(find_program(OsStr::new("/bin"), dir.path()).is_none());
        }

        #[test]
        fn test_exec_forwards_output_and_exits() {
            let shell = Interpreter::default();
            let (_, out, err) = start(&shell, "exec sh -c 'echo one; echo two >&2; echo three'");
            assert!(wait_until(|| shell.processes().is_empty()));
            assert_eq!(out.lines(), vec!["one", "three"]);
            assert_eq!(err.lines(), vec!["two"]);
        }

        #[test]
        fn test_exec_unknown_program_fails_to_start() {
            let shell = Interpreter::default();
            let out = BufferSink::new();
            let code =
                shell.execute_command("exec no-such-program-here", Arc::new(out.clone()), Arc::new(out.clone()));
            assert_eq!(code, 1);
            assert!(out.contents().contains("could not find program 'no-such-program-here'"));
            assert!(shell.processes().is_empty());
        }

        #[test]
        fn test_exec_is_killed_with_its_pipeline() {
            let shell = Interpreter::default();
            let (status, _, _) = start(&shell, "exec sleep 30");
            let PipelineStatus::Background(pid) = status else {
                panic!("expected a background pipeline");
            };
            let started = Instant::now();
            assert!(shell.kill(pid));
            assert!(shell.processes().is_empty());
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn test_exec_reads_piped_lines() {
            let shell = Interpreter::default();
            let (status, out, _) = start(&shell, "repeat -t 0.01 -c 2 'echo ping' | exec cat");
            let PipelineStatus::Background(pid) = status else {
                panic!("expected a background pipeline");
            };
            assert!(wait_until(|| out.lines().len() == 2));
            assert_eq!(out.lines(), vec!["ping", "ping"]);
            assert!(shell.processes().contains(pid));
            assert!(shell.kill(pid));
        }

        #[test]
        fn test_abandoned_child_is_killed_and_reaped() {
            let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
            let started = Instant::now();
            abandon(&mut child);
            assert!(child.try_wait().unwrap().is_some());
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn test_exec_reports_closed_input() {
            let shell = Interpreter::default();
            let (status, _, err) =
                start(&shell, "repeat -t 0.05 'echo x' | exec sh -c 'exec 0<&-; sleep 30'");
            let PipelineStatus::Background(pid) = status else {
                panic!("expected a background pipeline");
            };
            assert!(wait_until(|| err.lines().iter().any(|l| l.starts_with("exec: "))));
            assert!(shell.processes().contains(pid));
            assert!(shell.kill(pid));
            assert!(shell.processes().is_empty());
        }
    }
}
