//! Lambda handler wrapper.
//!
//! [`traced_handler`] wraps a handler function so every invocation is recorded and
//! reported. It is the only code that runs on the handler path, and it never changes
//! what the handler returns: the result, success or error, is handed back untouched.
//!
//! # Invocation flow
//!
//! 1. If `LUMIGO_SWITCH_OFF=true`, the handler runs untraced.
//! 2. The invocation context is reset with the request id and the function metadata.
//! 3. The function span starts. The remaining time is taken from the Lambda deadline.
//! 4. The handler runs.
//! 5. The function span ends with the return value or the error, and the report is sent.
//!
//! A handler that panics is reported with the error type `Panic` and the panic message,
//! then the panic continues unwinding into the runtime.
//!
//! # Errors
//!
//! Return an [`InvocationError`] (boxed into `lambda_runtime::Error`) to get the error
//! type and stack frames into the function span. Any other error is recorded with the
//! type `Error` and its display text.
//!
//! ```rust,no_run
//! use lumigo_tracer_lite::{init_tracer, traced_handler, InvocationError, TracerOptions};
//! use lambda_runtime::{service_fn, Error, LambdaEvent};
//! use serde_json::{json, Value};
//!
//! async fn handler(event: LambdaEvent<Value>) -> Result<Value, Error> {
//!     let Some(order) = event.payload.get("order") else {
//!         return Err(InvocationError::new("ValueError", "missing order").into());
//!     };
//!     Ok(json!({"statusCode": 200, "body": order.to_string()}))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let tracer = init_tracer(TracerOptions::default());
//!     lambda_runtime::run(service_fn(|event| traced_handler(tracer.clone(), event, handler))).await
//! }
//! ```

use crate::constants::span_keys;
use crate::context::InvocationOutcome;
use crate::error::{panic_message, InvocationError};
use crate::logger::Logger;
use crate::resource::FunctionMetadata;
use crate::span::now_ms;
use crate::tracer::Tracer;
use futures::FutureExt;
use lambda_runtime::{Error, LambdaEvent};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

static LOGGER: Logger = Logger::const_new("handler");

fn remaining_time(deadline_ms: u64) -> Duration {
    let now = u64::try_from(now_ms()).unwrap_or_default();
    Duration::from_millis(deadline_ms.saturating_sub(now))
}

fn outcome_of<R: Serialize>(result: &Result<R, Error>) -> InvocationOutcome {
    match result {
        Ok(response) => match serde_json::to_value(response) {
            Ok(value) => InvocationOutcome::Returned(value),
            Err(e) => InvocationOutcome::Unserializable(e.to_string()),
        },
        Err(err) => match err.downcast_ref::<InvocationError>() {
            Some(invocation_error) => InvocationOutcome::Failed(invocation_error.clone()),
            None => InvocationOutcome::Failed(InvocationError::without_stack("Error", err.to_string())),
        },
    }
}

/// Runs `handler_fn` for one invocation and reports it.
///
/// # Type Parameters
///
/// * `T` - The event payload type, serialized into the function span
/// * `R` - The response type, serialized into the function span
/// * `F` - The handler function type
/// * `Fut` - The future returned by the handler function
pub async fn traced_handler<T, R, F, Fut>(
    tracer: Tracer,
    event: LambdaEvent<T>,
    handler_fn: F,
) -> Result<R, Error>
where
    T: Serialize,
    R: Serialize,
    F: FnOnce(LambdaEvent<T>) -> Fut,
    Fut: Future<Output = Result<R, Error>>,
{
    if tracer.config().switch_off {
        return handler_fn(event).await;
    }

    let context = tracer.context();
    let metadata = FunctionMetadata::from_env().with_invoked_arn(&event.context.invoked_function_arn);
    context.reset(&event.context.request_id, metadata);

    let payload = serde_json::to_value(&event.payload).unwrap_or_else(|e| {
        LOGGER.warn(format!("Could not serialize the event: {e}"));
        Value::Null
    });
    context.start_function_span(&payload, remaining_time(event.context.deadline));

    let result = match AssertUnwindSafe(handler_fn(event)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let err = InvocationError::without_stack(span_keys::PANIC_ERROR, panic_message(payload.as_ref()));
            context.end_function_span(InvocationOutcome::Failed(err)).await;
            panic::resume_unwind(payload)
        }
    };

    context.end_function_span(outcome_of(&result)).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("key must be a string"))
        }
    }

    #[test]
    fn test_remaining_time() {
        let deadline = u64::try_from(now_ms()).unwrap() + 5_000;
        let remaining = remaining_time(deadline);
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));

        assert_eq!(remaining_time(0), Duration::ZERO);
    }

    #[test]
    fn test_outcome_of_value() {
        let result: Result<Value, Error> = Ok(serde_json::json!({"ok": true}));
        assert!(matches!(
            outcome_of(&result),
            InvocationOutcome::Returned(value) if value["ok"] == true
        ));
    }

    #[test]
    fn test_outcome_of_unserializable() {
        let result: Result<Unserializable, Error> = Ok(Unserializable);
        assert!(matches!(
            outcome_of(&result),
            InvocationOutcome::Unserializable(message) if message == "key must be a string"
        ));
    }

    #[test]
    fn test_outcome_of_errors() {
        let result: Result<Value, Error> = Err(InvocationError::without_stack("ValueError", "bad").into());
        let InvocationOutcome::Failed(err) = outcome_of(&result) else {
            panic!("expected a failure");
        };
        assert_eq!(err.type_name(), "ValueError");

        let result: Result<Value, Error> = Err("plain failure".into());
        let InvocationOutcome::Failed(err) = outcome_of(&result) else {
            panic!("expected a failure");
        };
        assert_eq!(err.type_name(), "Error");
        assert_eq!(err.message(), "plain failure");
    }
}
