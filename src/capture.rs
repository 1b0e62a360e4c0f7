//! Per-execution output capture.
//!
//! A [`CaptureSink`] holds the output and error buffers for exactly one
//! execution. Handles to it are cheap clones; the interpreter's stdout writer
//! keeps one, so the sink must reject writes once the execution has closed it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Write attempted after the sink was closed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("I/O operation on closed file.")]
pub struct SinkClosed;

/// Buffers handed back by [`CaptureSink::close`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub output: String,
    pub error: String,
}

#[derive(Debug, Default)]
struct Buffers {
    output: String,
    error: String,
    closed: bool,
}

/// Output and error buffers scoped to one execution.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    buffers: Arc<Mutex<Buffers>>,
}

impl CaptureSink {
    /// Fresh, empty buffers.
    pub fn open() -> Self {
        Self {
            buffers: Arc::new(Mutex::new(Buffers::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append text written to standard output by evaluated code.
    pub fn write_output(&self, text: &str) -> Result<(), SinkClosed> {
        let mut buffers = self.lock();
        if buffers.closed {
            return Err(SinkClosed);
        }
        buffers.output.push_str(text);
        Ok(())
    }

    /// Append formatted fault text. Only the engine calls this.
    pub fn record_error(&self, trace: &str) -> Result<(), SinkClosed> {
        let mut buffers = self.lock();
        if buffers.closed {
            return Err(SinkClosed);
        }
        buffers.error.push_str(trace);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the sink and take its contents. A second close returns empty buffers.
    pub fn close(&self) -> Captured {
        let mut buffers = self.lock();
        buffers.closed = true;
        Captured {
            output: std::mem::take(&mut buffers.output),
            error: std::mem::take(&mut buffers.error),
        }
    }
}

/// Closes the wrapped sink when dropped, on every exit path.
#[derive(Debug)]
pub struct SinkScope {
    sink: CaptureSink,
}

impl SinkScope {
    pub fn open() -> Self {
        Self {
            sink: CaptureSink::open(),
        }
    }

    pub const fn sink(&self) -> &CaptureSink {
        &self.sink
    }

    /// Close explicitly and take the buffers.
    pub fn finish(self) -> Captured {
        self.sink.close()
    }
}

impl Drop for SinkScope {
    fn drop(&mut self) {
        if !self.sink.is_closed() {
            self.sink.close();
        }
    }
}
