//! Execution backend trait and implementations.
//!
//! A backend hands out one [`SessionEngine`] per connection. The engine owns
//! that connection's binding environment and evaluates submissions against it,
//! one at a time, under the configured deadline.

mod python;

pub use python::PythonBackend;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Outcome of one submission: captured standard output and error text.
///
/// Fault and timeout details are carried in `error`; an engine never fails
/// with a Rust error for anything the evaluated code does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: String,
    pub error: String,
}

impl ExecutionResult {
    /// Evaluation finished normally.
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
        }
    }

    /// Evaluation faulted; `output` holds whatever was written before the fault.
    pub fn faulted(output: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: trace.into(),
        }
    }

    /// Evaluation overran the deadline. Partial output is dropped.
    pub fn timed_out(deadline: Duration) -> Self {
        Self {
            output: String::new(),
            error: timeout_message(deadline),
        }
    }

    /// Error-only result for failures outside the evaluated code.
    pub fn failure(message: impl std::fmt::Display) -> Self {
        Self {
            output: String::new(),
            error: format!("Error: {message}"),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Message reported when an execution is abandoned at its deadline.
pub fn timeout_message(deadline: Duration) -> String {
    format!(
        "Error: Code execution timed out after {} seconds",
        deadline.as_secs_f64()
    )
}

/// Factory for per-connection engines.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start a fresh, empty binding environment for one connection.
    async fn open_session(&self) -> Result<Box<dyn SessionEngine>>;

    /// Deadline applied to every execution.
    fn deadline(&self) -> Duration;
}

/// One connection's interpreter state.
///
/// Callers serialize access: `execute` takes `&mut self`, so a session never
/// has two submissions in flight.
#[async_trait]
pub trait SessionEngine: Send {
    /// Evaluate `code` against the session environment.
    async fn execute(&mut self, code: &str) -> ExecutionResult;

    /// Discard the environment and release the interpreter.
    async fn shutdown(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_whole_seconds() {
        assert_eq!(
            timeout_message(Duration::from_secs(30)),
            "Error: Code execution timed out after 30 seconds"
        );
    }

    #[test]
    fn timeout_message_fractional_seconds() {
        assert_eq!(
            timeout_message(Duration::from_millis(250)),
            "Error: Code execution timed out after 0.25 seconds"
        );
    }

    #[test]
    fn result_constructors() {
        let ok = ExecutionResult::completed("5\n");
        assert_eq!(ok.output, "5\n");
        assert!(!ok.is_error());

        let timed_out = ExecutionResult::timed_out(Duration::from_secs(1));
        assert!(timed_out.output.is_empty());
        assert!(timed_out.is_error());

        let failure = ExecutionResult::failure("worker gone");
        assert_eq!(failure.error, "Error: worker gone");
    }
}
