//! Size-bounded report construction.
//!
//! The collector rejects requests above a configured size, so the batcher decides
//! which spans make it into one report:
//!
//! 1. **Small reports** are sent as is. When pruning is off, or there are fewer spans
//!    than the count threshold and their encoded size is under `max_size`, every span
//!    is sent in its original order.
//!
//! 2. **Large reports** are pruned. The function span (always the last element) is
//!    kept. The remaining spans are ordered with failed exchanges first, keeping the
//!    original order among equals, and added greedily while the running size stays
//!    under `max_size`. Scanning stops after `too_big_threshold` spans failed to fit.
//!
//! Sizes are measured as the length of the base64 encoding of the compact JSON,
//! which is what the collector accounts for.
//!
//! Every report is redacted right before it is encoded.
//!
//! # Configuration
//!
//! - `LUMIGO_MAX_SIZE_FOR_REQUEST`: size cap in bytes, defaults to 900000
//! - `LUMIGO_PRUNE_TRACE_OFF`: set to "true" to never prune
//!
//! ```
//! use lumigo_tracer_lite::ReportBatcher;
//! use serde_json::json;
//!
//! let batcher = ReportBatcher::builder().max_size(1_000).build();
//! let body = batcher.build(&[json!({"id": "1", "password": "p"})]);
//! assert_eq!(body, r#"[{"id":"1","password":"****"}]"#);
//! ```

use crate::constants::{defaults, env_vars};
use crate::logger::env_flag;
use crate::redact::Redactor;
use base64::Engine;
use bon::bon;
use serde::Serialize;
use serde_json::Value;
use std::env;
use std::sync::Arc;

/// Base64 length of the compact JSON encoding of `value`.
pub fn encoded_size<T: Serialize + ?Sized>(value: &T) -> usize {
    match serde_json::to_vec(value) {
        Ok(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes).len(),
        Err(_) => usize::MAX,
    }
}

fn status_code(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

/// Whether a span describes a failure and should survive pruning first.
pub fn is_high_priority(span: &Value) -> bool {
    if span.get("error").is_some_and(|e| !e.is_null()) {
        return true;
    }
    if status_code(span.pointer("/info/httpInfo/response/statusCode")) > 400 {
        return true;
    }
    match span.get("returnValue") {
        Some(Value::String(text)) => serde_json::from_str::<Value>(text)
            .map(|parsed| status_code(parsed.get("statusCode")) > 400)
            .unwrap_or(false),
        Some(value) => status_code(value.get("statusCode")) > 400,
        None => false,
    }
}

/// Builds the JSON body of a report.
#[derive(Debug, Clone)]
pub struct ReportBatcher {
    redactor: Arc<Redactor>,
    prune: bool,
    max_size: usize,
    too_big_threshold: usize,
    count_threshold: usize,
}

#[bon]
impl ReportBatcher {
    /// Returns the size cap from environment or fallback value
    fn default_max_size() -> usize {
        env::var(env_vars::MAX_SIZE_FOR_REQUEST)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::MAX_SIZE_FOR_REQUEST)
    }

    #[builder]
    pub fn new(
        redactor: Option<Arc<Redactor>>,
        prune: Option<bool>,
        max_size: Option<usize>,
        too_big_threshold: Option<usize>,
        count_threshold: Option<usize>,
    ) -> Self {
        Self {
            redactor: redactor.unwrap_or_else(|| Arc::new(Redactor::from_env())),
            prune: prune.unwrap_or_else(|| !env_flag(env_vars::PRUNE_TRACE_OFF)),
            max_size: max_size.unwrap_or_else(Self::default_max_size),
            too_big_threshold: too_big_threshold.unwrap_or(defaults::TOO_BIG_SPANS_THRESHOLD),
            count_threshold: count_threshold
                .unwrap_or(defaults::NUMBER_OF_SPANS_IN_REPORT_OPTIMIZATION),
        }
    }
}

impl ReportBatcher {
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Produces the redacted JSON array to send. `spans` must end with the function span.
    pub fn build(&self, spans: &[Value]) -> String {
        let fits_as_is = spans.len() < self.count_threshold && encoded_size(spans) < self.max_size;
        if !self.prune || fits_as_is {
            return self.encode(spans.iter());
        }

        let Some((function_span, rest)) = spans.split_last() else {
            return "[]".to_string();
        };

        let mut ordered: Vec<&Value> = rest.iter().collect();
        // Stable: ties keep their original order.
        ordered.sort_by_key(|span| !is_high_priority(span));

        let mut selected = vec![function_span];
        let mut current_size = encoded_size(function_span);
        let mut too_big_spans = 0;
        for span in ordered {
            let span_size = encoded_size(span);
            if current_size.saturating_add(span_size) < self.max_size {
                selected.push(span);
                current_size += span_size;
            } else {
                too_big_spans += 1;
                if too_big_spans >= self.too_big_threshold {
                    break;
                }
            }
        }
        self.encode(selected.into_iter())
    }

    fn encode<'a>(&self, spans: impl Iterator<Item = &'a Value>) -> String {
        Value::Array(spans.map(|span| self.redactor.redact(span)).collect()).to_string()
    }
}
