use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use crate::command::LineSink;

/// Which standard stream a [`ConsoleSink`] writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Sink that prints lines to the process' standard output or standard error.
pub struct ConsoleSink {
    stream: Stream,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self {
            stream: Stream::Stdout,
        }
    }

    pub fn stderr() -> Self {
        Self {
            stream: Stream::Stderr,
        }
    }
}

impl LineSink for ConsoleSink {
    fn write_line(&self, line: &str) {
        let result = match self.stream {
            Stream::Stdout => writeln!(std::io::stdout().lock(), "{line}"),
            Stream::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        };
        if let Err(e) = result {
            log::warn!("console write failed: {e}");
        }
    }
}

/// Memory-backed sink collecting lines.
///
/// Cloning shares the underlying buffer, so a caller can keep a handle and read the
/// lines after the pipeline wrote them.
#[derive(Clone, Default)]
pub struct BufferSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All lines joined with `\n`, each terminated by a newline.
    pub fn contents(&self) -> String {
        self.lines()
            .iter()
            .map(|l| format!("{l}\n"))
            .collect::<String>()
    }

    /// Remove and return everything collected so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl LineSink for BufferSink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LineSink for NullSink {
    fn write_line(&self, _line: &str) {}
}
