//! Wire messages.
//!
//! The client sends raw code as a text frame; the server answers every
//! non-empty submission with one JSON [`Reply`].

use serde::{Deserialize, Serialize};

use crate::backend::ExecutionResult;

/// Reply sent for each non-empty submission.
///
/// Both fields are always present; an absent value is `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub output: String,
    pub error: String,
}

impl Reply {
    /// Best-effort notice sent before closing on a transport fault.
    pub fn diagnostic(message: impl std::fmt::Display) -> Self {
        Self {
            output: String::new(),
            error: format!("Error: {message}"),
        }
    }
}

impl From<ExecutionResult> for Reply {
    fn from(result: ExecutionResult) -> Self {
        Self {
            output: result.output,
            error: result.error,
        }
    }
}
