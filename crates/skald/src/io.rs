//! Output handling for the `print` builtin.
//!
//! Implement [`PrintWriter`] to capture or redirect program output from
//! embedded Skald code. The default [`StdPrint`] buffers and writes to
//! stdout; [`CollectStringPrint`] collects into a string for tests and
//! hosts; [`NoPrint`] discards everything.

use std::io::{self, Write as _};

/// Sink for program stdout produced by `print`.
pub trait PrintWriter {
    /// Writes one chunk of output. Chunks carry their own separators and
    /// newlines; implementations must not add any.
    fn write_str(&mut self, text: &str);
}

/// Default writer: buffers output and flushes to stdout when dropped or
/// explicitly flushed.
///
/// Buffering keeps tight `print` loops from paying one syscall per line.
#[derive(Debug, Default)]
pub struct StdPrint {
    buffer: String,
}

impl StdPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes buffered output to stdout now.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let _ = io::stdout().write_all(self.buffer.as_bytes());
        let _ = io::stdout().flush();
        self.buffer.clear();
    }
}

impl PrintWriter for StdPrint {
    fn write_str(&mut self, text: &str) {
        self.buffer.push_str(text);
        // Cap the buffer so long-running programs still stream output.
        if self.buffer.len() >= 8 * 1024 {
            self.flush();
        }
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Writer that collects all output into a string.
///
/// Useful for testing and for hosts that postprocess program output.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The output collected so far.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_str(&mut self, text: &str) {
        self.0.push_str(text);
    }
}

/// Writer that ignores all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_str(&mut self, _text: &str) {}
}
