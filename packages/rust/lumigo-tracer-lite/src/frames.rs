//! Bounded capture of the call stack of a failed invocation.

use crate::constants::defaults;
use crate::redact::{prepare_large_data, Redactor};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::OnceLock;

/// One frame of a call stack, as handed to [`capture_frames`].
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub file_name: String,
    pub lineno: u32,
    pub function: String,
    /// Local variables in declaration order.
    pub locals: Vec<(String, Value)>,
}

impl StackFrame {
    pub fn new(file_name: impl Into<String>, lineno: u32, function: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            lineno,
            function: function.into(),
            locals: Vec::new(),
        }
    }

    /// Adds a local variable to the frame.
    pub fn with_local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.push((name.into(), value));
        self
    }

    /// Frames of a captured backtrace, innermost first.
    ///
    /// Rust does not expose local variables at runtime, so the frames carry none.
    /// Frames of the backtrace machinery and of the capture site itself are dropped.
    pub fn from_backtrace(backtrace: &Backtrace) -> Vec<StackFrame> {
        if backtrace.status() != BacktraceStatus::Captured {
            return Vec::new();
        }
        Self::parse_backtrace(&backtrace.to_string())
    }

    /// Parses the `Display` rendering of a [`Backtrace`].
    pub fn parse_backtrace(text: &str) -> Vec<StackFrame> {
        static FRAME_RE: OnceLock<Option<Regex>> = OnceLock::new();
        static LOCATION_RE: OnceLock<Option<Regex>> = OnceLock::new();
        static HASH_RE: OnceLock<Option<Regex>> = OnceLock::new();

        let (Some(frame_re), Some(location_re), Some(hash_re)) = (
            FRAME_RE
                .get_or_init(|| Regex::new(r"^\s*\d+:\s+(.+)$").ok())
                .as_ref(),
            LOCATION_RE
                .get_or_init(|| Regex::new(r"^\s*at\s+(.+):(\d+):\d+$").ok())
                .as_ref(),
            HASH_RE
                .get_or_init(|| Regex::new(r"::h[0-9a-f]{16}$").ok())
                .as_ref(),
        ) else {
            return Vec::new();
        };

        let mut frames: Vec<StackFrame> = Vec::new();
        for line in text.lines() {
            if let Some(caps) = frame_re.captures(line) {
                let function = hash_re.replace(&caps[1], "").into_owned();
                frames.push(StackFrame::new("<unknown>", 0, function));
            } else if let Some(caps) = location_re.captures(line) {
                // A frame may list several locations when inlined; keep the first.
                if let Some(frame) = frames.last_mut().filter(|f| f.lineno == 0) {
                    frame.file_name = caps[1].to_string();
                    frame.lineno = caps[2].parse().unwrap_or(0);
                }
            }
        }

        let first_user_frame = frames
            .iter()
            .position(|f| !is_machinery_frame(f) && !is_agent_frame(f))
            .unwrap_or(frames.len());
        frames.split_off(first_user_frame)
    }
}

/// A frame as reported in the function span's error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorFrame {
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub lineno: u32,
    pub function: String,
    pub variables: Map<String, Value>,
}

fn is_machinery_frame(frame: &StackFrame) -> bool {
    const PREFIXES: &[&str] = &["std::", "core::", "alloc::", "backtrace::", "<std::", "<core::", "<alloc::"];
    PREFIXES.iter().any(|p| frame.function.starts_with(p))
}

/// Whether the frame belongs to this crate.
pub fn is_agent_frame(frame: &StackFrame) -> bool {
    static AGENT_FILE_RE: OnceLock<Option<Regex>> = OnceLock::new();

    let function = frame.function.trim_start_matches('<');
    if function.starts_with("lumigo_tracer_lite::") {
        return true;
    }
    AGENT_FILE_RE
        .get_or_init(|| Regex::new(r"lumigo[-_]tracer[-_]lite[^/\\]*[/\\]src[/\\]").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(&frame.file_name))
}

fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(usize::MAX)
}

/// Turns a stack into reportable frames without exceeding `budget` bytes.
///
/// Frames are taken innermost first. Capture stops at the first frame of this crate
/// (excluded) or when the budget runs out. Each variable is masked, rendered and cut
/// to 200 characters; a frame stops taking variables once they no longer fit.
/// The JSON-encoded sizes of the returned frames add up to at most `budget`.
pub fn capture_frames(stack: &[StackFrame], redactor: &Redactor, budget: usize) -> Vec<ErrorFrame> {
    let mut free_space = budget;
    let mut frames = Vec::new();

    for frame in stack {
        if free_space == 0 || is_agent_frame(frame) {
            break;
        }

        let mut captured = ErrorFrame {
            file_name: frame.file_name.clone(),
            lineno: frame.lineno,
            function: frame.function.clone(),
            variables: Map::new(),
        };
        let skeleton = encoded_len(&captured);
        if skeleton >= free_space {
            break;
        }
        let mut frame_space = free_space - skeleton;

        let locals: Map<String, Value> = frame.locals.iter().cloned().collect();
        if let Value::Object(masked) = redactor.redact(&Value::Object(locals)) {
            for (name, value) in masked {
                let var = Value::String(prepare_large_data(&value, defaults::MAX_VAR_LEN));
                let mut single = Map::new();
                single.insert(name.clone(), var.clone());
                // `{"k":"v"}` adds `"k":"v"` plus a separating comma when not first.
                let separator = usize::from(!captured.variables.is_empty());
                let added = encoded_len(&single) - 2 + separator;
                if added >= frame_space {
                    break;
                }
                frame_space -= added;
                captured.variables.insert(name, var);
            }
        }

        free_space = free_space.saturating_sub(encoded_len(&captured));
        frames.push(captured);
    }

    frames
}
