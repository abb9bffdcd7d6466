//! Structured logging (§2 expansion, "Logging & Activity Sink"): a
//! `tracing-subscriber` setup with a reopenable sink, since `HUP` must
//! reopen log files the way the original resque-pool does (§4.3).
//!
//! Grounded on the `TracingActivityLogger` pattern in
//! `airssys_osl::middleware::logger::loggers::tracing`.

// Layer 1: Standard library imports
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// Layer 2: Third-party crate imports
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

// Layer 3: Internal module imports
use crate::error::{ForemanError, ForemanResult};

/// Where activity events are written: stderr, or a file that can be reopened
/// in place (§GLOSSARY "LogSink").
enum Destination {
    Stderr,
    File { path: PathBuf, handle: Mutex<File> },
}

/// A reopenable log destination. Cloning shares the same underlying file
/// handle via an `Arc`, so the `tracing_subscriber::fmt` layer's writer and
/// the `HUP` handler's reopen call observe the same sink.
#[derive(Clone)]
pub struct LogSink(Arc<Destination>);

impl LogSink {
    pub fn stderr() -> Self {
        Self(Arc::new(Destination::Stderr))
    }

    pub fn file(path: impl AsRef<Path>) -> ForemanResult<Self> {
        let path = path.as_ref().to_path_buf();
        let handle = open_append(&path)?;
        Ok(Self(Arc::new(Destination::File {
            path,
            handle: Mutex::new(handle),
        })))
    }

    /// Reopen the underlying file, if this is a file sink (`HUP`, §4.3): the
    /// new handle points at the (possibly rotated) path, so an external log
    /// rotator swapping the file out from under the inode keeps working.
    pub fn reopen(&self) -> ForemanResult<()> {
        if let Destination::File { path, handle } = &*self.0 {
            let fresh = open_append(path)?;
            let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            *guard = fresh;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> ForemanResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ForemanError::config_load(format!("opening log file '{}': {e}", path.display())))
}

impl io::Write for &LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &*self.0 {
            Destination::Stderr => io::stderr().write(buf),
            Destination::File { handle, .. } => {
                let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                guard.write(buf)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &*self.0 {
            Destination::Stderr => io::stderr().flush(),
            Destination::File { handle, .. } => {
                let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                guard.flush()
            }
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = &'a LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

/// Default filter directive absent `RUST_LOG`, derived from §6's
/// `LOGGING`/`VERBOSE`/`VVERBOSE` passthrough variables: `VVERBOSE` wins
/// over `VERBOSE` wins over plain `LOGGING`, matching the original
/// resque-pool's verbosity precedence.
fn default_filter_directive() -> &'static str {
    if std::env::var_os("VVERBOSE").is_some() {
        "trace"
    } else if std::env::var_os("VERBOSE").is_some() {
        "debug"
    } else if std::env::var_os("LOGGING").is_some() {
        "info"
    } else {
        "warn"
    }
}

/// Install the global `tracing-subscriber` with an `EnvFilter` (default
/// from `default_filter_directive`, overridable via `RUST_LOG`) writing
/// through `sink`. Returns the sink so the caller can reopen it from the
/// `HUP` handler.
pub fn init(sink: LogSink) -> ForemanResult<LogSink> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink.clone())
        .try_init()
        .map_err(|e| ForemanError::config_load(format!("installing tracing subscriber: {e}")))?;

    Ok(sink)
}
