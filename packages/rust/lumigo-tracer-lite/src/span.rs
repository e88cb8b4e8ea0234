//! Span records and their mutation rules.
//!
//! A [`SpanRecorder`] holds everything observed during one invocation: exactly one
//! [`FunctionSpan`] and any number of [`HttpSpan`]s. It enforces the invocation
//! lifecycle (`New → Started → Ended`): once the function span has ended, further
//! mutations are ignored and logged.
//!
//! Spans are serialized in the collector's wire format. HTTP spans keep the raw
//! captured data and are rendered on demand, since the rendering depends on the
//! verbosity and domain-scrubbing settings.

use crate::capture::{parse_request_head, CorrelationKey, HttpCaptureEvent};
use crate::constants::{defaults, span_keys};
use crate::events::TriggerInfo;
use crate::frames::ErrorFrame;
use crate::logger::Logger;
use crate::parsers::{merge_into, ServiceParser};
use crate::redact::{prepare_large_data, truncate_chars};
use crate::resource::FunctionMetadata;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

static LOGGER: Logger = Logger::const_new("span");

// Raw bodies are cut well past the rendered limit so multi-byte text still renders fully
const MAX_BUFFERED_BODY: usize = defaults::MAX_ENTRY_SIZE * 4;

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle of the function span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    New,
    Started,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Function,
    Http,
}

/// A user-defined annotation on the function span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionTag {
    pub key: String,
    pub value: String,
}

/// The error recorded on the function span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    pub message: String,
    pub frames: Vec<ErrorFrame>,
}

/// The span describing the invocation itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSpan {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SpanKind,
    pub started: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended: Option<i64>,
    #[serde(rename = "maxFinishTime", skip_serializing_if = "Option::is_none")]
    pub max_finish_time: Option<i64>,
    pub token: String,
    #[serde(flatten)]
    pub metadata: FunctionMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(rename = "returnValue", skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporter_rtt: Option<u64>,
    pub info: TriggerInfo,
    #[serde(rename = "lumigo_execution_tags_no_scrub")]
    pub execution_tags: Vec<ExecutionTag>,
}

impl FunctionSpan {
    /// A fresh, open function span for `request_id`.
    pub fn new(request_id: &str, token: &str, metadata: FunctionMetadata) -> Self {
        Self {
            id: format!("{request_id}{}", span_keys::STARTED_SUFFIX),
            kind: SpanKind::Function,
            started: now_ms(),
            ended: None,
            max_finish_time: None,
            token: token.to_string(),
            metadata,
            event: None,
            return_value: None,
            error: None,
            reporter_rtt: None,
            info: TriggerInfo::default(),
            execution_tags: Vec::new(),
        }
    }

    /// The request id without the open-span suffix.
    pub fn request_id(&self) -> &str {
        self.id
            .strip_suffix(span_keys::STARTED_SUFFIX)
            .unwrap_or(&self.id)
    }

    pub fn is_open(&self) -> bool {
        self.id.ends_with(span_keys::STARTED_SUFFIX)
    }
}

/// Request side of an HTTP span. `None` means not observed yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequestData {
    pub method: Option<String>,
    pub path: Option<String>,
    pub uri: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Vec<u8>,
}

/// Response side of an HTTP span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponseData {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// One outbound HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpSpan {
    pub id: String,
    pub started: i64,
    pub ended: Option<i64>,
    pub host: String,
    pub request: HttpRequestData,
    pub response: Option<HttpResponseData>,
}

/// Settings that decide how much of an HTTP exchange is rendered.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions<'a> {
    pub verbose: bool,
    pub domains_scrubber: &'a [Regex],
}

fn headers_text(headers: &[(String, String)]) -> String {
    let map: Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    prepare_large_data(&Value::String(Value::Object(map).to_string()), defaults::MAX_ENTRY_SIZE)
}

fn body_text(body: &[u8]) -> String {
    truncate_chars(&String::from_utf8_lossy(body), defaults::MAX_ENTRY_SIZE)
}

fn append_limited(buffer: &mut Vec<u8>, bytes: &[u8]) {
    let room = MAX_BUFFERED_BODY.saturating_sub(buffer.len());
    buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

impl HttpSpan {
    fn new(host: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started: now_ms(),
            ended: None,
            host,
            request: HttpRequestData::default(),
            response: None,
        }
    }

    /// Whether the host's traffic must not be captured in detail.
    pub fn is_scrubbed(&self, options: &RenderOptions<'_>) -> bool {
        !options.verbose || options.domains_scrubber.iter().any(|re| re.is_match(&self.host))
    }

    /// Renders the span in wire format, enriched by the matching service parser.
    pub fn to_value(&self, options: &RenderOptions<'_>) -> Value {
        let scrubbed = self.is_scrubbed(options);

        let mut request = Map::new();
        if scrubbed {
            request.insert(
                "method".to_string(),
                json!(self.request.method.clone().unwrap_or_default()),
            );
            request.insert("body".to_string(), json!(span_keys::DATA_NOT_AVAILABLE));
        } else {
            if let Some(headers) = &self.request.headers {
                request.insert("headers".to_string(), json!(headers_text(headers)));
            }
            request.insert("body".to_string(), json!(body_text(&self.request.body)));
            if let Some(method) = &self.request.method {
                request.insert("method".to_string(), json!(method));
            }
            if let Some(uri) = &self.request.uri {
                request.insert("uri".to_string(), json!(uri));
            }
        }

        let mut http_info = Map::new();
        http_info.insert("host".to_string(), json!(self.host));
        http_info.insert("request".to_string(), Value::Object(request));
        if let Some(response) = &self.response {
            let rendered = if scrubbed {
                json!({"statusCode": response.status_code, "body": span_keys::DATA_NOT_AVAILABLE})
            } else {
                json!({
                    "headers": headers_text(&response.headers),
                    "body": body_text(&response.body),
                    "statusCode": response.status_code,
                })
            };
            http_info.insert("response".to_string(), rendered);
        }

        let mut span = Map::new();
        span.insert("id".to_string(), json!(self.id));
        span.insert("type".to_string(), json!(SpanKind::Http));
        span.insert("started".to_string(), json!(self.started));
        if let Some(ended) = self.ended {
            span.insert("ended".to_string(), json!(ended));
        }
        span.insert("info".to_string(), json!({"httpInfo": http_info}));

        let response_headers = self
            .response
            .as_ref()
            .map(|r| r.headers.as_slice())
            .unwrap_or_default();
        let parser = ServiceParser::for_host(&self.host, response_headers);
        merge_into(&mut span, parser.request_fields(&self.host, &self.request));
        if let Some(response) = &self.response {
            merge_into(&mut span, parser.response_fields(response));
        }
        Value::Object(span)
    }
}

/// Typed mutation API over the spans of one invocation.
#[derive(Debug, Clone)]
pub struct SpanRecorder {
    state: SpanState,
    function_span: FunctionSpan,
    http_spans: Vec<HttpSpan>,
    open_requests: HashMap<CorrelationKey, usize>,
}

impl SpanRecorder {
    pub fn new(function_span: FunctionSpan) -> Self {
        Self {
            state: SpanState::New,
            function_span,
            http_spans: Vec::new(),
            open_requests: HashMap::new(),
        }
    }

    pub fn state(&self) -> SpanState {
        self.state
    }

    pub fn function_span(&self) -> &FunctionSpan {
        &self.function_span
    }

    pub fn http_spans(&self) -> &[HttpSpan] {
        &self.http_spans
    }

    fn accepts_mutation(&self, operation: &str) -> bool {
        if self.state == SpanState::Ended {
            LOGGER.debug(format!("Ignoring {operation}: the invocation has already ended"));
            return false;
        }
        true
    }

    /// Moves `New → Started`, recording the start time and report deadline.
    pub fn start(
        &mut self,
        started: i64,
        max_finish_time: Option<i64>,
        event: Option<String>,
        info: TriggerInfo,
    ) -> bool {
        if self.state != SpanState::New {
            LOGGER.warn(format!("Cannot start a span in state {:?}", self.state));
            return false;
        }
        let span = &mut self.function_span;
        span.started = started;
        span.max_finish_time = max_finish_time;
        span.event = event;
        span.info = info;
        self.state = SpanState::Started;
        true
    }

    /// Moves to `Ended`, freezing the function span.
    ///
    /// HTTP exchanges that never completed are closed at the same time.
    pub fn end(&mut self, return_value: Option<String>, error: Option<ErrorInfo>) -> bool {
        if !self.accepts_mutation("end") {
            return false;
        }
        let ended = now_ms();
        let span = &mut self.function_span;
        span.id = span.request_id().to_string();
        span.ended = Some(ended);
        span.max_finish_time = None;
        span.return_value = return_value;
        span.error = error;
        for http in self.http_spans.iter_mut().filter(|s| s.ended.is_none()) {
            http.ended = Some(ended);
        }
        self.open_requests.clear();
        self.state = SpanState::Ended;
        true
    }

    /// Records the round trip of the terminal report.
    ///
    /// The only write allowed after the span has ended.
    pub fn set_reporter_rtt(&mut self, rtt: u64) {
        self.function_span.reporter_rtt = Some(rtt);
    }

    /// Appends an execution tag, truncating oversized keys and values.
    ///
    /// Returns `false` when the tag was dropped.
    pub fn add_execution_tag(&mut self, key: &str, value: &str) -> bool {
        if !self.accepts_mutation("execution tag") {
            return false;
        }
        let tags = &mut self.function_span.execution_tags;
        if tags.len() >= defaults::MAX_TAGS {
            LOGGER.warn(format!(
                "Skipping execution tag {key}: at most {} tags are allowed",
                defaults::MAX_TAGS
            ));
            return false;
        }
        tags.push(ExecutionTag {
            key: key.chars().take(defaults::MAX_TAG_KEY_LEN).collect(),
            value: value.chars().take(defaults::MAX_TAG_VALUE_LEN).collect(),
        });
        true
    }

    fn open_span(&mut self, host: String, key: CorrelationKey) -> usize {
        self.http_spans.push(HttpSpan::new(host));
        let index = self.http_spans.len() - 1;
        self.open_requests.insert(key, index);
        index
    }

    /// The in-flight span for `key`, opening a new one when there is none or when
    /// the event starts a new exchange on a finished one.
    fn span_for(&mut self, key: CorrelationKey, starts_exchange: impl Fn(&HttpSpan) -> bool) -> usize {
        match self.open_requests.get(&key).copied() {
            Some(index) if !starts_exchange(&self.http_spans[index]) => index,
            Some(index) => {
                let host = self.http_spans[index].host.clone();
                self.open_span(host, key)
            }
            None => self.open_span(String::new(), key),
        }
    }

    /// Applies one capture event.
    pub fn record_http_capture(&mut self, event: HttpCaptureEvent) -> bool {
        if !self.accepts_mutation("http capture") {
            return false;
        }
        match event {
            HttpCaptureEvent::Opened { host, key } => {
                self.open_span(host, key);
            }
            HttpCaptureEvent::RequestChunk {
                key,
                bytes,
                is_headers,
            } => {
                let index = self.span_for(key, |span| {
                    span.response.is_some() || (is_headers && span.request.headers.is_some())
                });
                let span = &mut self.http_spans[index];
                if is_headers {
                    let head = parse_request_head(&bytes);
                    span.request.uri = Some(format!("{}{}", span.host, head.path));
                    span.request.method = Some(head.method);
                    span.request.path = Some(head.path);
                    span.request.headers = Some(head.headers);
                    span.request.body.clear();
                    append_limited(&mut span.request.body, &head.body);
                } else {
                    append_limited(&mut span.request.body, &bytes);
                }
            }
            HttpCaptureEvent::ResponseReceived {
                key,
                status,
                headers,
                body,
            } => {
                let index = self.span_for(key, |span| span.response.is_some());
                let span = &mut self.http_spans[index];
                let mut buffered = Vec::new();
                append_limited(&mut buffered, &body);
                span.response = Some(HttpResponseData {
                    status_code: status,
                    headers: headers
                        .into_iter()
                        .map(|(k, v)| (k.to_lowercase(), v))
                        .collect(),
                    body: buffered,
                });
                span.ended = Some(now_ms());
            }
        }
        true
    }

    /// All spans in wire format, the function span last.
    pub fn report_spans(&self, options: &RenderOptions<'_>) -> Vec<Value> {
        let mut spans: Vec<Value> = self.http_spans.iter().map(|s| s.to_value(options)).collect();
        match serde_json::to_value(&self.function_span) {
            Ok(function_span) => spans.push(function_span),
            Err(e) => LOGGER.error(format!("Failed to serialize the function span: {e}")),
        }
        spans
    }
}
