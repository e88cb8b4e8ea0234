//! Lightweight invocation tracing for AWS Lambda functions.
//!
//! This crate records every invocation of a Lambda function as one function span plus
//! one span per outbound HTTP exchange, masks secrets, and posts the result as a single
//! size-bounded JSON report to the collector edge before the function returns or runs
//! out of time.
//!
//! # Features
//!
//! - **Handler wrapper**: [`traced_handler`] records the event, the trigger, the return
//!   value or error of each invocation, and never changes what the handler returns
//! - **Deadline guard**: a report is still attempted shortly before the Lambda timeout
//! - **Secret masking**: values under credential-like keys are replaced before sending
//! - **Bounded reports**: large reports are pruned with failed spans kept first
//! - **HTTP capture**: instrumentation feeds outbound traffic through a [`CaptureSink`]
//!
//! # Architecture
//!
//! - [`config`]: options and environment resolution
//! - [`span`]: span records and their lifecycle
//! - [`events`]: event reduction and trigger classification
//! - [`redact`]: secret masking
//! - [`frames`]: bounded stack frame capture
//! - [`capture`]: HTTP capture events
//! - [`logger`]: the tracer's own diagnostics, printed only with `LUMIGO_DEBUG=true`
//!
//! The [`InvocationContext`] ties these together for the running invocation, the
//! [`ReportBatcher`] builds the report body and the [`Reporter`] sends it.
//!
//! # Quick Start
//!
//! ```no_run
//! use lumigo_tracer_lite::{init_tracer, traced_handler, TracerOptions};
//! use lambda_runtime::{service_fn, Error, LambdaEvent};
//! use serde_json::Value;
//!
//! async fn handler(event: LambdaEvent<Value>) -> Result<Value, Error> {
//!     Ok(event.payload)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let tracer = init_tracer(TracerOptions::builder().token("t_123".to_string()).build());
//!
//!     lambda_runtime::run(service_fn(|event| traced_handler(tracer.clone(), event, handler))).await
//! }
//! ```
//!
//! # Configuration
//!
//! Most settings can also be given through environment variables:
//!
//! - `LUMIGO_TRACER_TOKEN`: token embedded in every report
//! - `LUMIGO_TRACER_HOST`: edge endpoint, defaults to the regional edge
//! - `LUMIGO_SWITCH_OFF`: set to "true" to run handlers untraced
//! - `LUMIGO_DEBUG`: set to "true" for the tracer's internal log lines
//!
//! See [`config`] for the full list and the precedence rules.

pub mod capture;
pub mod config;
pub mod constants;
pub mod events;
pub mod frames;
pub mod logger;
pub mod redact;
pub mod span;

mod batcher;
mod context;
mod deadline;
mod error;
mod handler;
mod parsers;
mod reporter;
mod resource;
mod tracer;

pub use batcher::{encoded_size, is_high_priority, ReportBatcher};
pub use capture::{CaptureSink, CorrelationKey, HttpCaptureEvent};
pub use config::{TracerConfig, TracerOptions};
pub use context::{InvocationContext, InvocationOutcome};
pub use deadline::{timeout_buffer, DeadlineGuard};
pub use error::{safe_execute, InvocationError, TracerError};
pub use frames::StackFrame;
pub use handler::traced_handler;
pub use logger::{warn_client, Logger};
pub use redact::Redactor;
pub use reporter::Reporter;
pub use resource::FunctionMetadata;
pub use span::SpanState;
pub use tracer::{init_tracer, Tracer};

#[cfg(doctest)]
#[macro_use]
extern crate doc_comment;

#[cfg(doctest)]
use doc_comment::doctest;

#[cfg(doctest)]
doctest!("../README.md", readme);
