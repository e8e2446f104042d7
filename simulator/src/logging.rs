use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::fmt::writer::MakeWriter;

/// Tees formatted log output to stdout and, optionally, a file.
#[derive(Clone)]
pub(crate) struct LogWriter {
    file: Option<Arc<Mutex<File>>>,
}

impl LogWriter {
    pub(crate) fn new(path: Option<PathBuf>) -> io::Result<Self> {
        let file = match path {
            Some(path) => Some(Arc::new(Mutex::new(File::create(path)?))),
            None => None,
        };
        Ok(Self { file })
    }
}

pub(crate) struct LogWriterGuard {
    file: Option<Arc<Mutex<File>>>,
}

impl LogWriterGuard {
    fn file(&self) -> Option<MutexGuard<'_, File>> {
        self.file
            .as_ref()
            .map(|file| file.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriterGuard {
            file: self.file.clone(),
        }
    }
}

impl Write for LogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Some(mut file) = self.file() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Some(mut file) = self.file() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Keeps the opening steps and a rolling tail of a run, dumped when the oracle trips.
pub(crate) struct EventLog {
    first: Vec<String>,
    first_limit: usize,
    tail: VecDeque<String>,
    tail_limit: usize,
    skipped: u64,
}

impl EventLog {
    pub(crate) fn new(first_limit: usize, tail_limit: usize) -> Self {
        Self {
            first: Vec::with_capacity(first_limit),
            first_limit,
            tail: VecDeque::with_capacity(tail_limit),
            tail_limit,
            skipped: 0,
        }
    }

    pub(crate) fn record(&mut self, message: String) {
        tracing::debug!("{message}");
        if self.first.len() < self.first_limit {
            self.first.push(message);
            return;
        }
        if self.tail_limit == 0 {
            self.skipped += 1;
            return;
        }
        if self.tail.len() == self.tail_limit {
            self.tail.pop_front();
            self.skipped += 1;
        }
        self.tail.push_back(message);
    }

    pub(crate) fn dump_failure(&self, reason: &str) {
        tracing::error!("invariant violated: {reason}");
        for line in &self.first {
            tracing::error!("  {line}");
        }
        if self.skipped > 0 {
            tracing::error!("  ... {} steps omitted ...", self.skipped);
        }
        for line in &self.tail {
            tracing::error!("  {line}");
        }
    }
}
