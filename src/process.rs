//! Pipeline stages and the process table of background pipelines.
//!
//! A pipeline whose first stage is asynchronous gets a process id and, once started,
//! is owned by the [`ProcessTable`] until it is killed or all of its asynchronous
//! stages exited. Removal from the table decides who finalizes a pipeline, so a kill
//! racing with a self-exit stops every stage exactly once.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::command::{Command, ExitCode, LineSink};
use crate::context::CommandContext;

/// Identifier of a background pipeline.
pub type Pid = u32;

/// One command bound to its context.
///
/// The command sits behind its own mutex: the executor starts it, the previous stage
/// feeds it lines, and any thread may stop it. A stop requested by the thread that is
/// currently inside this very command (a command killing its own pipeline) is deferred
/// until that call returns.
pub(crate) struct Stage {
    ctx: CommandContext,
    is_async: bool,
    command: Mutex<Box<dyn Command>>,
    active_thread: Mutex<Option<ThreadId>>,
    stopped: AtomicBool,
    stop_deferred: AtomicBool,
}

impl Stage {
    pub(crate) fn new(ctx: CommandContext, command: Box<dyn Command>) -> Self {
        Self {
            ctx,
            is_async: command.is_async(),
            command: Mutex::new(command),
            active_thread: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stop_deferred: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &CommandContext {
        &self.ctx
    }

    pub(crate) fn name(&self) -> &str {
        self.ctx.command_name()
    }

    fn active_thread(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.active_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_command<R>(
        &self,
        f: impl FnOnce(&mut dyn Command, &CommandContext) -> R,
    ) -> thread::Result<R> {
        let mut command = self.command.lock().unwrap_or_else(PoisonError::into_inner);
        *self.active_thread() = Some(thread::current().id());
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(command.as_mut(), &self.ctx)));
        *self.active_thread() = None;
        if self.stop_deferred.swap(false, Ordering::SeqCst) {
            log::debug!("running deferred stop of '{}'", self.name());
            command.stop(&self.ctx);
        }
        result
    }

    /// Run the command's `execute`, mapping errors and panics to status 1.
    pub(crate) fn start(&self) -> ExitCode {
        log::debug!("starting '{}'", self.name());
        match self.with_command(|command, ctx| command.execute(ctx)) {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                self.ctx.eprintln(format!("{}: {e:#}", self.name()));
                1
            }
            Err(_) => {
                self.ctx
                    .eprintln(format!("{}: unexpected failure", self.name()));
                1
            }
        }
    }

    fn line_read(&self, line: &str) {
        if self.is_stopped() {
            return;
        }
        if self
            .with_command(|command, _| command.line_read(line))
            .is_err()
        {
            log::warn!("'{}' panicked while reading input", self.name());
        }
    }

    /// Stop the command. Only the first call has an effect.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if *self.active_thread() == Some(thread::current().id()) {
            self.stop_deferred.store(true, Ordering::SeqCst);
            return;
        }
        log::debug!("stopping '{}'", self.name());
        let mut command = self.command.lock().unwrap_or_else(PoisonError::into_inner);
        command.stop(&self.ctx);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// An asynchronous stage that has not exited yet.
    fn is_live(&self) -> bool {
        self.is_async && !self.ctx.has_exited()
    }
}

/// Output sink of a stage that feeds the next stage's input.
pub(crate) struct PipeSink {
    next: Arc<Stage>,
}

impl PipeSink {
    pub(crate) fn new(next: Arc<Stage>) -> Self {
        Self { next }
    }
}

impl LineSink for PipeSink {
    fn write_line(&self, line: &str) {
        self.next.line_read(line);
    }
}

/// The stages created from one command line.
pub(crate) struct Pipeline {
    pid: Option<Pid>,
    command_line: String,
    stages: Vec<Arc<Stage>>,
}

impl Pipeline {
    pub(crate) fn new(pid: Option<Pid>, command_line: String, stages: Vec<Arc<Stage>>) -> Self {
        Self {
            pid,
            command_line,
            stages,
        }
    }

    pub(crate) fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub(crate) fn stages(&self) -> &[Arc<Stage>] {
        &self.stages
    }

    fn any_exited(&self) -> bool {
        self.stages.iter().any(|s| s.ctx.has_exited())
    }

    fn has_live_stage(&self) -> bool {
        self.stages.iter().any(|s| s.is_live())
    }

    /// Stop every stage. Safe to call repeatedly.
    pub(crate) fn finalize(&self) {
        for stage in &self.stages {
            stage.stop();
        }
    }
}

/// Entry of a `ps` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub command_line: String,
}

/// Background pipelines by process id.
pub struct ProcessTable {
    next_pid: AtomicU32,
    processes: Mutex<BTreeMap<Pid, Arc<Pipeline>>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1),
            processes: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Pid, Arc<Pipeline>>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out a new, never reused process id.
    pub fn allocate_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot of the running background pipelines, ordered by pid.
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.lock()
            .iter()
            .map(|(pid, pipeline)| ProcessInfo {
                pid: *pid,
                command_line: pipeline.command_line.clone(),
            })
            .collect()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lock().contains_key(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop the pipeline with this pid. Returns `false` if there is none.
    pub fn kill(&self, pid: Pid) -> bool {
        let removed = self.lock().remove(&pid);
        match removed {
            Some(pipeline) => {
                log::info!("killing {pid}: {}", pipeline.command_line);
                pipeline.finalize();
                true
            }
            None => false,
        }
    }

    /// Stop every background pipeline.
    pub fn kill_all(&self) {
        let all = std::mem::take(&mut *self.lock());
        for (pid, pipeline) in all {
            log::info!("killing {pid}: {}", pipeline.command_line);
            pipeline.finalize();
        }
    }

    /// Register a started pipeline, unless one of its stages already exited while it
    /// was starting, in which case it is finalized right away.
    ///
    /// The exit flags are read under the table lock, so an exit racing with the
    /// registration is either seen here or finds the pipeline in the table.
    pub(crate) fn register_or_finalize(&self, pipeline: Arc<Pipeline>) -> bool {
        if let Some(pid) = pipeline.pid() {
            let mut processes = self.lock();
            if !pipeline.any_exited() {
                log::info!("started {pid}: {}", pipeline.command_line);
                processes.insert(pid, pipeline);
                return true;
            }
        }
        pipeline.finalize();
        false
    }

    /// A stage of pipeline `pid` exited.
    pub(crate) fn notify_exit(&self, pid: Pid) {
        let finished = {
            let mut processes = self.lock();
            let done = processes
                .get(&pid)
                .is_some_and(|pipeline| !pipeline.has_live_stage());
            if done { processes.remove(&pid) } else { None }
        };
        if let Some(pipeline) = finished {
            log::info!("{pid} finished: {}", pipeline.command_line);
            pipeline.finalize();
        }
    }
}
