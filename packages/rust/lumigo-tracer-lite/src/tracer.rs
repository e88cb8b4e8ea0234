//! Tracer initialization and the handle user code talks to.

use crate::capture::{CaptureSink, HttpCaptureEvent};
use crate::config::{TracerConfig, TracerOptions};
use crate::context::InvocationContext;
use crate::logger::Logger;
use crate::reporter::Reporter;
use std::env;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;

static LOGGER: Logger = Logger::const_new("tracer");

/// Handle to the tracer of this process.
///
/// Cloning is cheap: every clone shares the same invocation state.
#[derive(Debug, Clone)]
pub struct Tracer {
    context: Arc<InvocationContext>,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        Self {
            context: Arc::new(InvocationContext::new(config)),
        }
    }

    /// A tracer that reports through `reporter` instead of the configured edge.
    pub fn with_reporter(config: TracerConfig, reporter: Reporter) -> Self {
        Self {
            context: Arc::new(InvocationContext::new(config).with_reporter(reporter)),
        }
    }

    pub fn context(&self) -> &Arc<InvocationContext> {
        &self.context
    }

    pub fn config(&self) -> &TracerConfig {
        self.context.config()
    }

    /// Annotates the current invocation. Never fails.
    pub fn add_execution_tag(&self, key: &str, value: &str) {
        self.context.add_execution_tag(key, value);
    }

    /// Prefixes a log line with the request id when enhanced print is on.
    pub fn decorate_line(&self, line: &str) -> String {
        if !self.config().enhanced_print {
            return line.to_string();
        }
        match self.context.function_span() {
            Some(span) => format!("RequestId: {} {line}", span.request_id()),
            None => line.to_string(),
        }
    }
}

impl CaptureSink for Tracer {
    fn capture(&self, event: HttpCaptureEvent) {
        self.context.record_http_capture(event);
    }
}

/// Installs a `tracing` fmt subscriber for the tracer's own events.
///
/// The level filter is read from `RUST_LOG`, else `AWS_LAMBDA_LOG_LEVEL`. Output is JSON
/// when `AWS_LAMBDA_LOG_FORMAT=JSON`. An already installed global subscriber is kept.
fn install_fmt_layer() {
    let env_var_name = if env::var("RUST_LOG").is_ok() {
        "RUST_LOG"
    } else {
        "AWS_LAMBDA_LOG_LEVEL"
    };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var(env_var_name)
        .from_env_lossy();
    let subscriber = tracing_subscriber::registry::Registry::default().with(env_filter);

    let is_json = env::var("AWS_LAMBDA_LOG_FORMAT")
        .unwrap_or_default()
        .to_uppercase()
        == "JSON";

    let result = if is_json {
        tracing::subscriber::set_global_default(
            subscriber.with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .without_time()
                    .json(),
            ),
        )
    } else {
        tracing::subscriber::set_global_default(
            subscriber.with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .without_time()
                    .with_ansi(false),
            ),
        )
    };
    if let Err(e) = result {
        LOGGER.debug(format!("Keeping the existing tracing subscriber: {e}"));
    }
}

/// Resolves the configuration and creates the process tracer.
///
/// ```no_run
/// use lumigo_tracer_lite::{init_tracer, traced_handler, TracerOptions};
/// use lambda_runtime::{service_fn, Error, LambdaEvent};
/// use serde_json::Value;
///
/// async fn handler(event: LambdaEvent<Value>) -> Result<Value, Error> {
///     Ok(serde_json::json!({"statusCode": 200}))
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Error> {
///     let tracer = init_tracer(TracerOptions::default());
///     lambda_runtime::run(service_fn(|event| traced_handler(tracer.clone(), event, handler))).await
/// }
/// ```
pub fn init_tracer(options: TracerOptions) -> Tracer {
    let config = TracerConfig::resolve(&options);
    if config.enable_fmt_layer {
        install_fmt_layer();
    }
    if config.switch_off {
        LOGGER.info("The tracer is switched off");
    }
    if config.should_report && config.token.is_empty() {
        LOGGER.warn("No tracer token was configured");
    }
    Tracer::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CorrelationKey;
    use crate::resource::FunctionMetadata;
    use crate::span::SpanState;
    use serial_test::serial;

    fn tracer(enhance_print: bool) -> Tracer {
        let options = TracerOptions::builder()
            .should_report(false)
            .enhance_print(enhance_print)
            .build();
        let tracer = init_tracer(options);
        tracer.context().reset("req-1", FunctionMetadata::default());
        tracer
    }

    #[test]
    #[serial]
    fn test_decorate_line() {
        assert_eq!(tracer(false).decorate_line("hello"), "hello");
        assert_eq!(tracer(true).decorate_line("hello"), "RequestId: req-1 hello");
    }

    #[tokio::test]
    #[serial]
    async fn test_clones_share_state() {
        let tracer = tracer(false);
        tracer
            .context()
            .start_function_span(&serde_json::json!({}), std::time::Duration::from_secs(1));
        let clone = tracer.clone();

        clone.add_execution_tag("k", "v");
        clone.opened("www.google.com", CorrelationKey(1));
        clone.request_chunk(CorrelationKey(1), b"GET / HTTP/1.1\r\n\r\n", true);

        assert_eq!(tracer.context().state(), SpanState::Started);
        assert_eq!(tracer.context().function_span().unwrap().execution_tags.len(), 1);
        let http = tracer.context().http_spans();
        assert_eq!(http.len(), 1);
        assert_eq!(http[0].request.method.as_deref(), Some("GET"));
    }

    #[test]
    #[serial]
    fn test_init_with_fmt_layer_twice() {
        let options = TracerOptions::builder()
            .should_report(false)
            .enable_fmt_layer(true)
            .build();
        init_tracer(options.clone());
        init_tracer(options);
    }
}
