//! Error types and the boundary that keeps tracer failures away from user code.
//!
//! Two kinds of errors live here:
//!
//! - [`TracerError`] covers the tracer's own fallible steps (configuration parsing,
//!   serialization, transport). These never reach the caller: every public operation
//!   funnels them through [`safe_execute`], which logs and discards them.
//! - [`InvocationError`] is what a traced handler returns when *user* code fails. It
//!   carries an error type name, a message and the stack frames reported in the
//!   function span. The tracer observes it and hands it back unchanged.

use crate::frames::StackFrame;
use crate::logger::Logger;
use std::backtrace::Backtrace;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

static LOGGER: Logger = Logger::const_new("error");

/// Errors raised inside the tracer itself.
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("invalid configuration for {name}: {reason}")]
    Config { name: &'static str, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("transport failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// An error raised by the traced function.
///
/// Construct it where the failure happens so the captured backtrace points at the
/// raising frame:
///
/// ```
/// use lumigo_tracer_lite::InvocationError;
///
/// fn charge(amount: u64) -> Result<(), InvocationError> {
///     if amount == 0 {
///         return Err(InvocationError::new("ValueError", "amount must be positive"));
///     }
///     Ok(())
/// }
///
/// let err = charge(0).unwrap_err();
/// assert_eq!(err.type_name(), "ValueError");
/// ```
#[derive(Debug, Clone)]
pub struct InvocationError {
    type_name: String,
    message: String,
    stack: Vec<StackFrame>,
}

impl InvocationError {
    /// Creates the error and captures the current call stack.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let backtrace = Backtrace::force_capture();
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: StackFrame::from_backtrace(&backtrace),
        }
    }

    /// Creates the error without capturing a stack.
    pub fn without_stack(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Wraps any error. The type name is the last path segment of `E`.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let short = full.rsplit("::").next().unwrap_or(full);
        Self::new(short, err.to_string())
    }

    /// Replaces the captured stack, innermost frame first.
    ///
    /// Use this when the caller knows more than the backtrace, e.g. local variables.
    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        self.stack = frames;
        self
    }

    /// Pushes a frame in front of the captured stack.
    pub fn with_frame(mut self, frame: StackFrame) -> Self {
        self.stack.insert(0, frame);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Captured frames, innermost first.
    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for InvocationError {}

/// Text of a panic payload, as given to `panic!`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs one tracer step, turning errors and panics into a logged `None`.
///
/// `part` names the failing component in the log line.
pub fn safe_execute<T>(part: &str, f: impl FnOnce() -> Result<T, TracerError>) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            LOGGER.error(format!("An exception occurred in lumigo's code {part}: {err}"));
            None
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            LOGGER.error(format!("A panic occurred in lumigo's code {part}: {reason}"));
            None
        }
    }
}
