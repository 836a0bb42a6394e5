//! Error types for the embedding layer
//!
//! Two families of failure cross the boundary:
//! - script errors, raised by the engine while compiling or running code, and
//!   returned to the caller as values;
//! - precondition violations, raised when the host misuses the API (closed
//!   contexts, out-of-order scope pops, stale values, unknown handles).

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::registry::Handle;
use crate::value::ValueKind;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Message reported when the isolate stopped a script on request
pub(crate) const TERMINATED_MESSAGE: &str =
    "ExecutionTerminated: script execution has been terminated";

/// A structured failure describing why source failed to compile or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptError {
    /// The exception converted to a string, e.g. `SyntaxError: Unexpected end of input`
    pub message: String,
    /// `origin:line:column` of the failing source, when the engine knows it
    pub location: Option<String>,
    /// The JavaScript stack trace, when one was captured
    pub stack: Option<String>,
    /// Set when the script was stopped through a terminate handle
    pub terminated: bool,
}

impl ScriptError {
    pub(crate) fn terminated() -> Self {
        Self {
            message: TERMINATED_MESSAGE.to_string(),
            location: None,
            stack: None,
            terminated: true,
        }
    }
}

impl fmt::Display for ScriptError {
    /// `{}` prints the message only. `{:#}` prints the stack trace when
    /// there is one, otherwise the message followed by the location.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            if let Some(stack) = &self.stack {
                return f.write_str(stack);
            }
            if let Some(location) = &self.location {
                return write!(f, "{} (at {})", self.message, location);
            }
        }
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptError {}

#[derive(Debug, Error)]
pub enum Error {
    /// The engine reported an exception
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("context is closed")]
    ContextClosed,

    #[error("value scope {given} is not the innermost open scope (current: {current})")]
    ScopeMismatch { given: u64, current: u64 },

    #[error("value #{index} was released when value scope {scope} was popped")]
    StaleValue { scope: u64, index: u32 },

    #[error("handle {0} is not registered")]
    UnknownHandle(Handle),

    #[error("isolate is already running a call on this thread")]
    IsolateBusy,

    #[error("handles from different isolates cannot be mixed")]
    IsolateMismatch,

    #[error("expected {expected}, found {found:?}")]
    TypeMismatch {
        expected: &'static str,
        found: ValueKind,
    },

    #[error("no function callback registered under index {0}")]
    UnknownCallback(i32),

    #[error("string of {0} bytes exceeds the engine's string length limit")]
    StringTooLong(usize),

    /// Raised by host callbacks; thrown into script as an `Error`
    #[error("{0}")]
    Callback(String),

    #[error("invalid JSON from engine: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Convenience constructor for host callbacks
    pub fn callback(message: impl Into<String>) -> Self {
        Error::Callback(message.into())
    }

    pub fn is_script_error(&self) -> bool {
        matches!(self, Error::Script(_))
    }

    /// True when the error signals a bug in the calling program rather than
    /// a failure inside the engine.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            Error::ContextClosed
                | Error::ScopeMismatch { .. }
                | Error::StaleValue { .. }
                | Error::UnknownHandle(_)
                | Error::IsolateBusy
                | Error::IsolateMismatch
                | Error::UnknownCallback(_)
        )
    }

    /// The script error, if this is one
    pub fn as_script_error(&self) -> Option<&ScriptError> {
        match self {
            Error::Script(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScriptError {
        ScriptError {
            message: "ReferenceError: foo is not defined".to_string(),
            location: Some("main.js:1:1".to_string()),
            stack: None,
            terminated: false,
        }
    }

    #[test]
    fn test_script_error_display() {
        let err = sample();
        assert_eq!(err.to_string(), "ReferenceError: foo is not defined");
        assert_eq!(
            format!("{:#}", err),
            "ReferenceError: foo is not defined (at main.js:1:1)"
        );

        let with_stack = ScriptError {
            stack: Some("ReferenceError: foo is not defined\n    at main.js:1:1".to_string()),
            ..sample()
        };
        assert!(format!("{:#}", with_stack).contains("    at main.js:1:1"));
    }

    #[test]
    fn test_error_classification() {
        let script = Error::from(sample());
        assert!(script.is_script_error());
        assert!(!script.is_precondition_violation());
        assert!(script.as_script_error().is_some());

        let misuse = Error::ScopeMismatch { given: 2, current: 3 };
        assert!(misuse.is_precondition_violation());
        assert!(!misuse.is_script_error());
        assert!(!Error::callback("boom").is_precondition_violation());
    }

    #[test]
    fn test_terminated_error() {
        let err = ScriptError::terminated();
        assert!(err.terminated);
        assert!(err.message.starts_with("ExecutionTerminated"));
    }
}
