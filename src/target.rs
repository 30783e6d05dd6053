//! Named redirection targets shared between pipelines.
//!
//! `>` and `>>` stages write into a [`Target`] looked up by name. A target remembers
//! which stages write into it; once the last writer of an auto-closing target is gone
//! the sink is flushed and the name becomes free again.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::context::CommandContext;
use crate::error::{Result, ShellError};
use crate::process::{Pid, ProcessTable};

/// Backing storage of a target.
pub trait TargetSink: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Flush and release the underlying resource.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Whether the target goes away with its last writer.
    ///
    /// Sinks such as windows that the user closes explicitly return `false`.
    fn auto_close(&self) -> bool {
        true
    }
}

/// Creates sinks for target names with a given prefix.
pub trait TargetFactory: Send + Sync {
    fn create(&self, name: &str, append: bool) -> io::Result<Box<dyn TargetSink>>;
}

/// Default factory: the target name is a file path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTargetFactory;

impl TargetFactory for FileTargetFactory {
    fn create(&self, name: &str, append: bool) -> io::Result<Box<dyn TargetSink>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(Path::new(name))?;
        Ok(Box::new(FileSink {
            writer: BufWriter::new(file),
        }))
    }
}

struct FileSink {
    writer: BufWriter<File>,
}

impl TargetSink for FileSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{line}")
    }

    fn close(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct Writer {
    context_id: u64,
    pid: Option<Pid>,
}

struct TargetState {
    sink: Option<Box<dyn TargetSink>>,
    writers: Vec<Writer>,
}

/// A named sink together with the stages writing into it.
pub struct Target {
    id: u64,
    name: String,
    auto_close: bool,
    state: Mutex<TargetState>,
}

impl Target {
    fn lock(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write a line. Lines written after the target was closed are dropped.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        match self.lock().sink.as_mut() {
            Some(sink) => sink.write_line(line),
            None => Ok(()),
        }
    }

    pub fn writer_count(&self) -> usize {
        self.lock().writers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().sink.is_none()
    }
}

fn close_sink(name: &str, mut sink: Box<dyn TargetSink>) {
    match sink.close() {
        Ok(()) => log::debug!("closed target {name}"),
        Err(e) => log::warn!("{name}: close failed: {e}"),
    }
}

/// Entry of a `files` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub name: String,
    pub writers: usize,
}

/// All open targets by name, plus the factories that create them.
pub struct TargetRegistry {
    next_id: AtomicU64,
    targets: Mutex<HashMap<String, Arc<Target>>>,
    factories: RwLock<Vec<(String, Arc<dyn TargetFactory>)>>,
    default_factory: Arc<dyn TargetFactory>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new(FileTargetFactory)
    }
}

impl TargetRegistry {
    /// Registry using `default_factory` for names without a registered prefix.
    pub fn new(default_factory: impl TargetFactory + 'static) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            targets: Mutex::new(HashMap::new()),
            factories: RwLock::new(Vec::new()),
            default_factory: Arc::new(default_factory),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Target>>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Use `factory` for every target name starting with `prefix` (e.g. `window:`).
    pub fn register_factory(&self, prefix: &str, factory: impl TargetFactory + 'static) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((prefix.to_string(), Arc::new(factory)));
    }

    fn factory_for(&self, name: &str) -> Arc<dyn TargetFactory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, factory)| Arc::clone(factory))
            .unwrap_or_else(|| Arc::clone(&self.default_factory))
    }

    /// Attach the stage of `ctx` as a writer of target `name`, creating it if needed.
    ///
    /// Truncating a target that still has writers fails with
    /// [`ShellError::TargetConflict`].
    pub fn open(&self, name: &str, append: bool, ctx: &CommandContext) -> Result<Arc<Target>> {
        let writer = Writer {
            context_id: ctx.id(),
            pid: ctx.pid(),
        };
        let mut targets = self.lock();
        if let Some(target) = targets.get(name) {
            let mut state = target.lock();
            if !append && !state.writers.is_empty() {
                return Err(ShellError::TargetConflict(name.to_string()));
            }
            state.writers.push(writer);
            return Ok(Arc::clone(target));
        }

        let sink = self.factory_for(name).create(name, append)?;
        let target = Arc::new(Target {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            auto_close: sink.auto_close(),
            state: Mutex::new(TargetState {
                sink: Some(sink),
                writers: vec![writer],
            }),
        });
        log::debug!("opened target {name} (id {})", target.id);
        targets.insert(name.to_string(), Arc::clone(&target));
        Ok(target)
    }

    /// Remove the stage of `ctx` from the writers of `target`.
    ///
    /// An auto-closing target without writers is closed and its name freed. A newer
    /// target registered under the same name is left alone.
    pub fn detach(&self, target: &Arc<Target>, ctx: &CommandContext) {
        let released = {
            let mut targets = self.lock();
            let mut state = target.lock();
            state.writers.retain(|w| w.context_id != ctx.id());
            if target.auto_close && state.writers.is_empty() {
                if targets
                    .get(&target.name)
                    .is_some_and(|current| Arc::ptr_eq(current, target))
                {
                    targets.remove(&target.name);
                }
                state.sink.take()
            } else {
                None
            }
        };
        if let Some(sink) = released {
            close_sink(&target.name, sink);
        }
    }

    /// Close target `name` regardless of its writers and kill the background
    /// pipelines writing into it.
    pub fn force_close(&self, name: &str, processes: &ProcessTable) -> Result<()> {
        let target = self
            .lock()
            .remove(name)
            .ok_or_else(|| ShellError::UnknownTarget(name.to_string()))?;
        let (sink, writers) = {
            let mut state = target.lock();
            (state.sink.take(), std::mem::take(&mut state.writers))
        };
        if let Some(sink) = sink {
            close_sink(name, sink);
        }
        let mut pids: Vec<Pid> = writers.iter().filter_map(|w| w.pid).collect();
        pids.sort_unstable();
        pids.dedup();
        for pid in pids {
            processes.kill(pid);
        }
        Ok(())
    }

    /// Close every target without touching its writers.
    pub fn close_all(&self) {
        let all: Vec<Arc<Target>> = self.lock().drain().map(|(_, t)| t).collect();
        for target in all {
            let sink = target.lock().sink.take();
            if let Some(sink) = sink {
                close_sink(&target.name, sink);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Open targets sorted by name.
    pub fn list(&self) -> Vec<TargetInfo> {
        let mut infos: Vec<TargetInfo> = self
            .lock()
            .values()
            .map(|t| TargetInfo {
                name: t.name.clone(),
                writers: t.writer_count(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
