//! Capture events produced by HTTP client instrumentation.
//!
//! This crate does not hook any HTTP client itself. Whatever intercepts outbound
//! traffic reports what it sees through a [`CaptureSink`], keyed by a
//! [`CorrelationKey`] that identifies one connection or request object.

/// Identity of the connection or request object that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey(pub u64);

impl From<u64> for CorrelationKey {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// One observation of an outbound HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpCaptureEvent {
    /// A connection to `host` was opened.
    Opened { host: String, key: CorrelationKey },
    /// Bytes were written. With `is_headers` the chunk starts with an HTTP/1.x
    /// request head, otherwise it is a continuation of the body.
    RequestChunk {
        key: CorrelationKey,
        bytes: Vec<u8>,
        is_headers: bool,
    },
    /// A response arrived.
    ResponseReceived {
        key: CorrelationKey,
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
}

/// Receiver of capture events.
///
/// Implementations must never fail or panic into the caller: a broken capture
/// only loses the span.
pub trait CaptureSink {
    fn capture(&self, event: HttpCaptureEvent);

    fn opened(&self, host: &str, key: CorrelationKey) {
        self.capture(HttpCaptureEvent::Opened {
            host: host.to_string(),
            key,
        });
    }

    fn request_chunk(&self, key: CorrelationKey, bytes: &[u8], is_headers: bool) {
        self.capture(HttpCaptureEvent::RequestChunk {
            key,
            bytes: bytes.to_vec(),
            is_headers,
        });
    }

    fn response_received(
        &self,
        key: CorrelationKey,
        status: u16,
        headers: Vec<(String, String)>,
        body: &[u8],
    ) {
        self.capture(HttpCaptureEvent::ResponseReceived {
            key,
            status,
            headers,
            body: body.to_vec(),
        });
    }
}

/// The parsed head of an HTTP/1.x request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Header names are lowercased.
    pub headers: Vec<(String, String)>,
    /// Bytes that followed the head in the same chunk.
    pub body: Vec<u8>,
}

/// Parses a request head such as `POST /path HTTP/1.1\r\nhost: x\r\n\r\nbody`.
///
/// Lenient: malformed header lines are skipped and a missing blank line means the
/// whole chunk is head.
pub fn parse_request_head(bytes: &[u8]) -> RequestHead {
    let (head, body) = match find_subsequence(bytes, b"\r\n\r\n") {
        Some(pos) => (&bytes[..pos], bytes[pos + 4..].to_vec()),
        None => (bytes, Vec::new()),
    };
    let head = String::from_utf8_lossy(head);
    let mut lines = head.split("\r\n");

    let mut parsed = RequestHead {
        body,
        ..RequestHead::default()
    };
    if let Some(request_line) = lines.next() {
        let mut parts = request_line.split_whitespace();
        parsed.method = parts.next().unwrap_or_default().to_string();
        parsed.path = parts.next().unwrap_or_default().to_string();
    }
    parsed.headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_lowercase(), value.trim().to_string()))
        })
        .collect();
    parsed
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
