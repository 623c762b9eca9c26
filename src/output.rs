//! Output/error sink pair threaded through every lifecycle operation.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Destination for text captured from hook scripts.
///
/// Hook stdout goes to `out`, stderr to `err`. Write failures on a sink are
/// logged and otherwise ignored: losing console output never fails a stage.
pub struct OutputSinks {
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
}

impl OutputSinks {
    pub fn new(out: impl Write + Send + 'static, err: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            err: Box::new(err),
        }
    }

    /// Sinks wired to the process stdout/stderr.
    pub fn stdio() -> Self {
        Self::new(std::io::stdout(), std::io::stderr())
    }

    /// Sinks that discard everything.
    pub fn null() -> Self {
        Self::new(std::io::sink(), std::io::sink())
    }

    /// In-memory sinks; returns the buffers so callers can inspect them.
    pub fn capture() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        let sinks = Self::new(
            SharedBuffer(Arc::clone(&captured.out)),
            SharedBuffer(Arc::clone(&captured.err)),
        );
        (sinks, captured)
    }

    pub fn write_out(&mut self, text: &str) {
        write_text(&mut self.out, text, "out");
    }

    pub fn write_err(&mut self, text: &str) {
        write_text(&mut self.err, text, "err");
    }
}

fn write_text(sink: &mut Box<dyn Write + Send>, text: &str, name: &str) {
    if text.is_empty() {
        return;
    }
    if let Err(e) = sink.write_all(text.as_bytes()).and_then(|_| sink.flush()) {
        tracing::warn!(sink = name, error = %e, "Failed to write hook output");
    }
}

/// Buffers backing [`OutputSinks::capture`].
#[derive(Clone, Default)]
pub struct CapturedOutput {
    out: Arc<Mutex<Vec<u8>>>,
    err: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn out(&self) -> String {
        read_buffer(&self.out)
    }

    pub fn err(&self) -> String {
        read_buffer(&self.err)
    }
}

fn read_buffer(buf: &Mutex<Vec<u8>>) -> String {
    let guard = buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    String::from_utf8_lossy(&guard).into_owned()
}

struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
