//! Per-invocation state shared between the handler path and the deadline guard.
//!
//! The [`InvocationContext`] owns the [`SpanRecorder`] of the running invocation and
//! drives its lifecycle:
//!
//! 1. [`reset`](InvocationContext::reset) starts from a fresh function span and cancels
//!    any guard left over from a previous invocation.
//! 2. [`start_function_span`](InvocationContext::start_function_span) records the event
//!    and trigger, computes the report deadline and arms the [`DeadlineGuard`].
//! 3. [`end_function_span`](InvocationContext::end_function_span) records the outcome,
//!    cancels the guard and sends the terminal report.
//!
//! The guard callback and the normal end both try to claim a single flush flag. The
//! first one wins and is the only one that reports, so an invocation produces at most
//! one report. The flag is tagged with a generation that every reset bumps, so a guard
//! armed by an earlier invocation can never claim the flush of a later one.

use crate::batcher::ReportBatcher;
use crate::capture::HttpCaptureEvent;
use crate::config::TracerConfig;
use crate::constants::{defaults, span_keys};
use crate::deadline::{timeout_buffer, DeadlineGuard};
use crate::error::{safe_execute, InvocationError};
use crate::events::{classify_trigger, parse_event};
use crate::frames::capture_frames;
use crate::logger::Logger;
use crate::redact::truncate_chars;
use crate::reporter::Reporter;
use crate::resource::FunctionMetadata;
use crate::span::{
    now_ms, ErrorInfo, FunctionSpan, HttpSpan, RenderOptions, SpanRecorder, SpanState,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

static LOGGER: Logger = Logger::const_new("context");

// Lowest bit of the flush state. The bits above it count invocations.
const FLUSHED: u64 = 1;

/// How the traced function finished.
#[derive(Debug, Clone)]
pub enum InvocationOutcome {
    /// The function returned this value.
    Returned(Value),
    /// The function returned a value that could not be serialized.
    Unserializable(String),
    /// The function failed.
    Failed(InvocationError),
}

/// State of the running invocation.
#[derive(Debug)]
pub struct InvocationContext {
    config: TracerConfig,
    reporter: Reporter,
    batcher: ReportBatcher,
    recorder: Mutex<SpanRecorder>,
    guard: Mutex<Option<DeadlineGuard>>,
    flush_state: AtomicU64,
}

fn unserializable_error(message: &str) -> ErrorInfo {
    ErrorInfo {
        type_name: span_keys::RETURN_VALUE_ERROR.to_string(),
        message: format!(
            "The lambda will probably fail due to bad return value. Original message: \"{message}\""
        ),
        frames: Vec::new(),
    }
}

impl InvocationContext {
    pub fn new(config: TracerConfig) -> Self {
        let reporter = Reporter::new(config.host.clone(), config.should_report, config.edge_timeout);
        let batcher = ReportBatcher::builder()
            .redactor(config.redactor.clone())
            .build();
        let function_span = FunctionSpan::new("", &config.token, FunctionMetadata::default());
        Self {
            config,
            reporter,
            batcher,
            recorder: Mutex::new(SpanRecorder::new(function_span)),
            guard: Mutex::new(None),
            flush_state: AtomicU64::new(0),
        }
    }

    /// Replaces the reporter, e.g. to point it at a test collector.
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    fn render_options(&self) -> RenderOptions<'_> {
        RenderOptions {
            verbose: self.config.verbose,
            domains_scrubber: &self.config.domains_scrubber,
        }
    }

    fn with_recorder<T>(&self, part: &str, f: impl FnOnce(&mut SpanRecorder) -> T) -> Option<T> {
        safe_execute(part, || {
            let mut recorder = recover(self.recorder.lock(), "span recorder");
            Ok(f(&mut recorder))
        })
    }

    fn take_guard(&self) -> Option<DeadlineGuard> {
        recover(self.guard.lock(), "deadline guard").take()
    }

    /// Generation of the running invocation.
    fn generation(&self) -> u64 {
        self.flush_state.load(Ordering::SeqCst) & !FLUSHED
    }

    /// Starts a new invocation, dropping every span of the previous one.
    pub fn reset(&self, request_id: &str, metadata: FunctionMetadata) {
        if let Some(mut guard) = self.take_guard() {
            guard.cancel();
        }
        // Moves to the next generation and clears the flushed bit in one step.
        let _ = self
            .flush_state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| Some((state | FLUSHED) + 1));
        let function_span = FunctionSpan::new(request_id, &self.config.token, metadata);
        self.with_recorder("reset", |recorder| {
            *recorder = SpanRecorder::new(function_span);
        });
    }

    /// Records the invocation start and arms the deadline guard.
    ///
    /// `remaining` is the time left until the platform kills the invocation.
    pub fn start_function_span(self: &Arc<Self>, event: &Value, remaining: Duration) {
        let started = now_ms();
        let buffer = timeout_buffer(remaining, self.config.timeout_timer_buffer);
        let report_window = remaining.saturating_sub(buffer);
        let max_finish_time = started + i64::try_from(report_window.as_millis()).unwrap_or(i64::MAX);

        let started_ok = self
            .with_recorder("start function span", |recorder| {
                let reduced = self.config.redactor.redact(&parse_event(event));
                let event_text = truncate_chars(&reduced.to_string(), defaults::MAX_ENTRY_SIZE);
                let info = classify_trigger(event, self.config.step_function);
                recorder.start(started, Some(max_finish_time), Some(event_text), info)
            })
            .unwrap_or(false);
        if !started_ok {
            return;
        }

        if !self.config.timeout_timer {
            return;
        }
        if buffer >= remaining {
            LOGGER.info(format!(
                "Remaining time {remaining:?} is within the buffer {buffer:?}, not arming the deadline guard"
            ));
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let generation = self.generation();
        let guard = DeadlineGuard::arm(report_window, move || async move {
            if let Some(context) = weak.upgrade() {
                context.flush_generation(generation).await;
            }
        });
        *recover(self.guard.lock(), "deadline guard") = guard;
    }

    /// Claims the single flush of invocation `generation`.
    ///
    /// Only the first caller gets `true`, and only while `generation` is still running.
    fn claim_flush(&self, generation: u64) -> bool {
        self.flush_state
            .compare_exchange(generation, generation | FLUSHED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Reports the started function span and the HTTP spans seen so far.
    ///
    /// The function span stays open so the invocation can still end normally.
    pub async fn flush_on_deadline(&self) {
        self.flush_generation(self.generation()).await;
    }

    async fn flush_generation(&self, generation: u64) {
        if !self.claim_flush(generation) {
            LOGGER.debug("Spans were already reported or the invocation is over, skipping the deadline flush");
            return;
        }
        let Some((region, spans)) = self.with_recorder("deadline flush", |recorder| {
            (
                recorder.function_span().metadata.region.clone(),
                recorder.report_spans(&self.render_options()),
            )
        }) else {
            return;
        };
        let body = self.batcher.build(&spans);
        self.reporter.send(&region, body).await;
    }

    /// Records the outcome and sends the terminal report.
    pub async fn end_function_span(&self, outcome: InvocationOutcome) {
        if let Some(mut guard) = self.take_guard() {
            if !guard.cancel() {
                LOGGER.debug("The deadline guard already fired");
            }
        }

        let (return_value, error) = match outcome {
            InvocationOutcome::Returned(value) => {
                let redacted = self.config.redactor.redact(&value);
                (
                    Some(truncate_chars(&redacted.to_string(), defaults::MAX_ENTRY_SIZE)),
                    None,
                )
            }
            InvocationOutcome::Unserializable(message) => (None, Some(unserializable_error(&message))),
            InvocationOutcome::Failed(err) => {
                let frames = capture_frames(err.stack(), &self.config.redactor, defaults::MAX_VARS_SIZE);
                let info = ErrorInfo {
                    type_name: err.type_name().to_string(),
                    message: err.message().to_string(),
                    frames,
                };
                (None, Some(info))
            }
        };

        let ended = self
            .with_recorder("end function span", |recorder| recorder.end(return_value, error))
            .unwrap_or(false);
        if !ended {
            return;
        }

        if !self.claim_flush(self.generation()) {
            LOGGER.info("Spans were already reported by the deadline guard");
            return;
        }

        let Some((region, spans, has_error)) = self.with_recorder("report spans", |recorder| {
            let span = recorder.function_span();
            (
                span.metadata.region.clone(),
                recorder.report_spans(&self.render_options()),
                span.error.is_some(),
            )
        }) else {
            return;
        };
        if self.config.send_only_if_error && !has_error {
            LOGGER.debug("No error detected, skipping the report");
            return;
        }

        let body = self.batcher.build(&spans);
        let rtt = self.reporter.send(&region, body).await;
        self.with_recorder("reporter rtt", |recorder| recorder.set_reporter_rtt(rtt));
    }

    /// Applies one HTTP capture event.
    pub fn record_http_capture(&self, event: HttpCaptureEvent) {
        self.with_recorder("http capture", |recorder| recorder.record_http_capture(event));
    }

    /// Adds an execution tag. Oversized tags are truncated, nothing ever fails.
    pub fn add_execution_tag(&self, key: &str, value: &str) {
        self.with_recorder("execution tag", |recorder| recorder.add_execution_tag(key, value));
    }

    pub fn state(&self) -> SpanState {
        self.with_recorder("state", |recorder| recorder.state())
            .unwrap_or(SpanState::New)
    }

    /// Copy of the function span.
    pub fn function_span(&self) -> Option<FunctionSpan> {
        self.with_recorder("function span", |recorder| recorder.function_span().clone())
    }

    /// Copy of the HTTP spans.
    pub fn http_spans(&self) -> Vec<HttpSpan> {
        self.with_recorder("http spans", |recorder| recorder.http_spans().to_vec())
            .unwrap_or_default()
    }

    /// Every span in wire format, unredacted, the function span last.
    pub fn report_spans(&self) -> Vec<Value> {
        self.with_recorder("report spans", |recorder| {
            recorder.report_spans(&self.render_options())
        })
        .unwrap_or_default()
    }

    /// Whether the invocation has already been reported.
    pub fn is_flushed(&self) -> bool {
        self.flush_state.load(Ordering::SeqCst) & FLUSHED == FLUSHED
    }
}

/// Takes the lock even if a panic poisoned it. The worst a panic leaves behind is a
/// partly updated span, and the next `reset` replaces it.
fn recover<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
    name: &str,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned| {
        LOGGER.debug(format!("Recovering the poisoned {name} lock"));
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CorrelationKey;
    use crate::config::TracerOptions;
    use crate::frames::StackFrame;
    use serde_json::json;
    use serial_test::serial;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(timeout_timer: bool) -> TracerConfig {
        let options = TracerOptions::builder()
            .token("t_123".to_string())
            .should_report(false)
            .timeout_timer(timeout_timer)
            .build();
        TracerConfig::resolve(&options)
    }

    fn context(timeout_timer: bool) -> Arc<InvocationContext> {
        let context = Arc::new(InvocationContext::new(config(timeout_timer)));
        context.reset("req-1", FunctionMetadata::default());
        context
    }

    async fn reporting_context(server: &MockServer) -> Arc<InvocationContext> {
        let reporter = Reporter::new(Some(server.uri()), true, Duration::from_secs(2));
        let context = Arc::new(InvocationContext::new(config(true)).with_reporter(reporter));
        context.reset("req-1", FunctionMetadata::default());
        context
    }

    #[tokio::test]
    #[serial]
    async fn test_start_records_event_and_deadline() {
        let context = context(false);
        let event = json!({"httpMethod": "GET", "requestContext": {}, "password": "p"});

        context.start_function_span(&event, Duration::from_secs(10));

        assert_eq!(context.state(), SpanState::Started);
        let span = context.function_span().unwrap();
        let max_finish_time = span.max_finish_time.unwrap();
        // 10s remaining leaves a 1s buffer.
        assert!((max_finish_time - span.started - 9_000).abs() <= 5);
        let event_text = span.event.unwrap();
        assert!(event_text.contains("GET"));
        assert!(!event_text.contains("\"p\""));
    }

    #[tokio::test]
    #[serial]
    async fn test_end_with_error_captures_frames() {
        let context = context(false);
        context.start_function_span(&json!({}), Duration::from_secs(10));

        let err = InvocationError::without_stack("ValueError", "bad input").with_frames(vec![
            StackFrame::new("/var/task/src/main.rs", 12, "app::handle").with_local("password", json!("p")),
        ]);
        context.end_function_span(InvocationOutcome::Failed(err)).await;

        let span = context.function_span().unwrap();
        assert_eq!(context.state(), SpanState::Ended);
        assert_eq!(span.id, "req-1");
        assert!(span.return_value.is_none());
        assert!(span.max_finish_time.is_none());
        let error = span.error.unwrap();
        assert_eq!(error.type_name, "ValueError");
        assert_eq!(error.frames.len(), 1);
        assert_eq!(error.frames[0].variables["password"], "****");
        assert_eq!(span.reporter_rtt, Some(0));
    }

    #[tokio::test]
    #[serial]
    async fn test_unserializable_return_value() {
        let context = context(false);
        context.start_function_span(&json!({}), Duration::from_secs(10));

        context
            .end_function_span(InvocationOutcome::Unserializable("key must be a string".to_string()))
            .await;

        let error = context.function_span().unwrap().error.unwrap();
        assert_eq!(error.type_name, "ReturnValueError");
        assert!(error.message.contains("Original message: \"key must be a string\""));
    }

    #[tokio::test]
    #[serial]
    async fn test_mutations_after_end_are_ignored() {
        let context = context(false);
        context.start_function_span(&json!({}), Duration::from_secs(10));
        context.end_function_span(InvocationOutcome::Returned(json!("ok"))).await;

        context.add_execution_tag("k", "v");
        context.record_http_capture(HttpCaptureEvent::Opened {
            host: "h".to_string(),
            key: CorrelationKey(1),
        });

        assert!(context.function_span().unwrap().execution_tags.is_empty());
        assert!(context.http_spans().is_empty());
        assert_eq!(context.function_span().unwrap().return_value.as_deref(), Some("\"ok\""));
    }

    #[tokio::test]
    #[serial]
    async fn test_reset_starts_fresh() {
        let context = context(false);
        context.start_function_span(&json!({}), Duration::from_secs(10));
        context.add_execution_tag("k", "v");
        context.end_function_span(InvocationOutcome::Returned(Value::Null)).await;

        context.reset("req-2", FunctionMetadata::default());

        assert_eq!(context.state(), SpanState::New);
        assert!(!context.is_flushed());
        let span = context.function_span().unwrap();
        assert_eq!(span.id, "req-2_started");
        assert!(span.execution_tags.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_end_reports_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let context = reporting_context(&server).await;
        context.start_function_span(&json!({}), Duration::from_secs(10));

        context.end_function_span(InvocationOutcome::Returned(json!({"statusCode": 200}))).await;
        context.end_function_span(InvocationOutcome::Returned(json!({"statusCode": 200}))).await;

        assert!(context.function_span().unwrap().reporter_rtt.unwrap() > 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_deadline_flush_then_end_reports_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let context = reporting_context(&server).await;
        context.start_function_span(&json!({}), Duration::from_secs(10));

        context.flush_on_deadline().await;
        assert!(context.is_flushed());
        assert_eq!(context.state(), SpanState::Started);
        assert!(context.function_span().unwrap().is_open());

        context.end_function_span(InvocationOutcome::Returned(Value::Null)).await;
        assert_eq!(context.state(), SpanState::Ended);

        let requests = server.received_requests().await.unwrap();
        let body: Vec<Value> = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.last().unwrap()["id"], "req-1_started");
    }

    #[tokio::test]
    #[serial]
    async fn test_guard_not_armed_when_buffer_exceeds_remaining() {
        let context = context(true);
        context.start_function_span(&json!({}), Duration::from_millis(300));
        assert!(context.take_guard().is_none());

        context.reset("req-2", FunctionMetadata::default());
        context.start_function_span(&json!({}), Duration::from_secs(10));
        assert!(context.take_guard().is_some());
    }

    #[tokio::test]
    #[serial]
    async fn test_tracer_recovers_after_recorder_panic() {
        let context = context(false);
        context.start_function_span(&json!({}), Duration::from_secs(10));

        let result = context.with_recorder::<()>("failing step", |_| panic!("recorder failure"));
        assert!(result.is_none());
        assert!(context.recorder.is_poisoned());

        context.reset("req-2", FunctionMetadata::default());
        context.start_function_span(&json!({"order": 1}), Duration::from_secs(10));

        assert_eq!(context.state(), SpanState::Started);
        let span = context.function_span().unwrap();
        assert_eq!(span.id, "req-2_started");
        assert_eq!(span.event.as_deref(), Some(r#"{"order":1}"#));

        context.end_function_span(InvocationOutcome::Returned(Value::Null)).await;
        assert_eq!(context.state(), SpanState::Ended);
        assert!(context.is_flushed());
    }

    #[tokio::test]
    #[serial]
    async fn test_stale_deadline_flush_is_ignored_after_reset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let context = reporting_context(&server).await;
        context.start_function_span(&json!({}), Duration::from_secs(10));
        let previous = context.generation();

        context.reset("req-2", FunctionMetadata::default());
        context.start_function_span(&json!({}), Duration::from_secs(10));
        assert_ne!(context.generation(), previous);

        context.flush_generation(previous).await;
        assert!(!context.is_flushed());

        context.end_function_span(InvocationOutcome::Returned(Value::Null)).await;
        assert!(context.is_flushed());

        let requests = server.received_requests().await.unwrap();
        let body: Vec<Value> = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.last().unwrap()["id"], "req-2");
    }

    #[tokio::test]
    #[serial]
    async fn test_start_accepts_any_event_shape() {
        let events = [
            Value::Null,
            json!(42),
            json!("plain text"),
            json!([{"Records": "not a list"}]),
            json!({"Records": [null, 1, {"eventSource": 7}]}),
            json!({"requestContext": "not an object", "headers": [1, 2]}),
        ];
        for event in events {
            let context = context(false);
            context.start_function_span(&event, Duration::from_secs(10));
            assert_eq!(context.state(), SpanState::Started, "event {event}");
            assert!(context.function_span().unwrap().event.is_some());
        }
    }
}
