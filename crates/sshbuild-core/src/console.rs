//! Shared handle to the user-facing output stream
//!
//! Command echoes and relayed process output go through the same writer so
//! they interleave in the order they were produced.

use crossterm::style::Stylize;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Cloneable, thread-safe writer for user-visible output
#[derive(Clone)]
pub struct Console {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Echo a command line before it runs
    pub fn echo(&self, command: &str) {
        let line = format!("$ {}", command).cyan();
        let mut out = self.lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            tracing::warn!("Failed to echo command: {}", e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        // A panicked writer leaves nothing half-updated worth refusing over.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for Console {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}
