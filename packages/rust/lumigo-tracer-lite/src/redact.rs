//! Secret masking for captured payloads.
//!
//! The [`Redactor`] walks any JSON value and replaces the value of every key that
//! matches one of its patterns with `"****"`. Strings that hold a JSON object are
//! parsed, masked and re-encoded, so a secret nested inside a request body does not
//! leak either.
//!
//! Patterns are matched case-insensitively against the start of the key. The default
//! list masks anything that looks like a password, key, secret or credential:
//!
//! ```
//! use lumigo_tracer_lite::redact::Redactor;
//! use serde_json::json;
//!
//! let redactor = Redactor::default();
//! let masked = redactor.redact(&json!({"user": "bob", "password": "hunter2"}));
//! assert_eq!(masked, json!({"user": "bob", "password": "****"}));
//! ```
//!
//! The list can be replaced with a JSON array in `LUMIGO_SECRET_MASKING_REGEX`
//! (or the deprecated `LUMIGO_BLACKLIST_REGEX`).

use crate::constants::{defaults, env_vars, span_keys};
use crate::error::TracerError;
use crate::logger::Logger;
use regex::Regex;
use serde_json::{Map, Value};
use std::env;

static LOGGER: Logger = Logger::const_new("redact");

/// Masks values under secret-looking keys.
#[derive(Debug, Clone)]
pub struct Redactor {
    regexes: Vec<Regex>,
}

/// Compiles `pattern` to match case-insensitively from the start of the text.
pub(crate) fn anchored_pattern(pattern: &str) -> Result<Regex, TracerError> {
    Ok(Regex::new(&format!("(?i)^(?:{pattern})"))?)
}

/// Parses a JSON array of regex strings, as found in the pattern environment variables.
pub(crate) fn parse_pattern_list(raw: &str) -> Result<Vec<String>, TracerError> {
    Ok(serde_json::from_str(raw)?)
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(defaults::OMITTING_KEYS_REGEXES)
    }
}

impl Redactor {
    /// Compiles the given patterns. Patterns that fail to compile are skipped.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let regexes = patterns
            .iter()
            .filter_map(|p| {
                let p = p.as_ref();
                match anchored_pattern(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        LOGGER.warn(format!("Skipping invalid masking pattern {p:?}: {e}"));
                        None
                    }
                }
            })
            .collect();
        Self { regexes }
    }

    /// Builds the redactor from the masking environment variables.
    ///
    /// A value that is not a JSON array of strings is reported and the default
    /// patterns are used instead.
    pub fn from_env() -> Self {
        let raw = env::var(env_vars::SECRET_MASKING_REGEX)
            .or_else(|_| env::var(env_vars::SECRET_MASKING_REGEX_BACKWARD_COMP));

        let Ok(raw) = raw else {
            return Self::default();
        };

        match parse_pattern_list(&raw) {
            Ok(patterns) => Self::new(&patterns),
            Err(e) => {
                LOGGER.warn(format!(
                    "Invalid masking regex list {raw:?}, using the default list: {e}"
                ));
                Self::default()
            }
        }
    }

    /// Whether `key` should be masked.
    pub fn is_secret_key(&self, key: &str) -> bool {
        self.regexes.iter().any(|re| re.is_match(key))
    }

    /// Returns a copy of `value` with secret values replaced by the mask.
    ///
    /// The result has the same shape as the input. Only leaf values under matching
    /// keys change, and applying it twice gives the same result as applying it once.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            Value::String(text) => match self.redact_text(text) {
                Some(masked) => Value::String(masked),
                None => value.clone(),
            },
            Value::Object(map) => Value::Object(self.redact_map(map)),
            _ => value.clone(),
        }
    }

    /// Masks a string that encodes a JSON object.
    ///
    /// Returns `None` when the text is not a JSON object, in which case it is kept as is.
    pub fn redact_text(&self, text: &str) -> Option<String> {
        if !text.starts_with('{') {
            return None;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => serde_json::to_string(&self.redact_map(&map)).ok(),
            _ => None,
        }
    }

    fn redact_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let masked = if span_keys::SKIP_SCRUBBING_KEYS.contains(&key.as_str()) {
                    value.clone()
                } else if self.is_secret_key(key) {
                    Value::String(span_keys::MASK.to_string())
                } else {
                    self.redact(value)
                };
                (key.clone(), masked)
            })
            .collect()
    }
}

/// Renders a value as text and truncates it to `max_size` characters.
///
/// Strings are used as is, anything else is JSON-encoded. Truncated output ends
/// with `...[too long]`.
pub fn prepare_large_data(value: &Value, max_size: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate_chars(&text, max_size)
}

/// Truncates `text` to `max_size` characters, marking the cut.
pub(crate) fn truncate_chars(text: &str, max_size: usize) -> String {
    match text.char_indices().nth(max_size) {
        Some((cut, _)) => format!("{}{}", &text[..cut], span_keys::TOO_LONG_MARKER),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    fn cleanup_env() {
        env::remove_var(env_vars::SECRET_MASKING_REGEX);
        env::remove_var(env_vars::SECRET_MASKING_REGEX_BACKWARD_COMP);
    }

    #[test]
    fn test_pattern_helpers_report_typed_errors() {
        assert!(anchored_pattern("pass").unwrap().is_match("PASSWORD"));
        assert!(!anchored_pattern("pass").unwrap().is_match("bypass"));
        assert!(matches!(anchored_pattern("(unclosed"), Err(TracerError::Pattern(_))));

        assert_eq!(parse_pattern_list(r#"["a", "b"]"#).unwrap(), vec!["a", "b"]);
        assert!(matches!(parse_pattern_list("[a"), Err(TracerError::Serialization(_))));
    }

    #[test]
    fn test_masks_nested_keys() {
        let redactor = Redactor::default();
        let input = json!({
            "a": {"b": [{"apiKey": "k1", "name": "n"}]},
            "Authorization": "Bearer x",
            "count": 3
        });

        let output = redactor.redact(&input);

        assert_eq!(
            output,
            json!({
                "a": {"b": [{"apiKey": "****", "name": "n"}]},
                "Authorization": "****",
                "count": 3
            })
        );
    }

    #[test]
    fn test_patterns_are_anchored_at_start() {
        let redactor = Redactor::new(&["token"]);
        assert!(redactor.is_secret_key("token"));
        assert!(redactor.is_secret_key("TOKEN_VALUE"));
        assert!(!redactor.is_secret_key("my_token"));
    }

    #[test]
    fn test_json_text_is_masked_and_reencoded() {
        let redactor = Redactor::default();
        let input = json!({"body": "{\"password\": \"p\", \"user\": \"u\"}"});

        let output = redactor.redact(&input);

        let body = output["body"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed, json!({"password": "****", "user": "u"}));
    }

    #[test]
    fn test_non_object_text_is_unchanged() {
        let redactor = Redactor::default();
        for text in ["{not json", "[1, 2]", "plain", "{\"a\": 1"] {
            assert_eq!(redactor.redact(&json!(text)), json!(text));
        }
        assert_eq!(redactor.redact_text("[{\"password\": 1}]"), None);
    }

    #[test]
    fn test_skip_list_keys_pass_through() {
        let redactor = Redactor::new(&[".*"]);
        let tags = json!([{"key": "secret", "value": "v"}]);
        let input = json!({span_keys::EXECUTION_TAGS_KEY: tags.clone(), "other": 1});

        let output = redactor.redact(&input);

        assert_eq!(output[span_keys::EXECUTION_TAGS_KEY], tags);
        assert_eq!(output["other"], json!("****"));
    }

    #[test]
    fn test_redact_is_idempotent() {
        let redactor = Redactor::default();
        let input = json!([
            {"secret": {"inner": 1}, "list": ["{\"key\": 2}", null, true, 1.5]},
            "{\"credentials\": {\"a\": 1}, \"ok\": [1]}",
            {"deep": {"deeper": {"passcode": "x", "keep": "y"}}}
        ]);

        let once = redactor.redact(&input);
        let twice = redactor.redact(&once);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_scalars_unchanged() {
        let redactor = Redactor::default();
        for value in [json!(null), json!(true), json!(42), json!(-1.5)] {
            assert_eq!(redactor.redact(&value), value);
        }
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let redactor = Redactor::new(&["(unclosed", "pass.*"]);
        assert!(redactor.is_secret_key("password"));
        assert!(!redactor.is_secret_key("(unclosed"));
    }

    #[test]
    #[serial]
    fn test_from_env_override() {
        cleanup_env();
        env::set_var(env_vars::SECRET_MASKING_REGEX, r#"["bla"]"#);

        let redactor = Redactor::from_env();

        assert!(redactor.is_secret_key("blabla"));
        assert!(!redactor.is_secret_key("password"));
        cleanup_env();
    }

    #[test]
    #[serial]
    fn test_from_env_backward_compatible_name() {
        cleanup_env();
        env::set_var(env_vars::SECRET_MASKING_REGEX_BACKWARD_COMP, r#"["old.*"]"#);

        let redactor = Redactor::from_env();

        assert!(redactor.is_secret_key("oldname"));
        cleanup_env();
    }

    #[test]
    #[serial]
    fn test_from_env_malformed_uses_defaults() {
        cleanup_env();
        env::set_var(env_vars::SECRET_MASKING_REGEX, "[not json");

        let redactor = Redactor::from_env();

        assert!(redactor.is_secret_key("password"));
        cleanup_env();
    }

    #[test]
    fn test_prepare_large_data() {
        assert_eq!(prepare_large_data(&json!("abc"), 10), "abc");
        assert_eq!(prepare_large_data(&json!({"a": 1}), 100), r#"{"a":1}"#);
        assert_eq!(prepare_large_data(&json!("abcdef"), 3), "abc...[too long]");
        assert_eq!(prepare_large_data(&json!(null), 10), "null");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("ééé", 2), "éé...[too long]");
        assert_eq!(truncate_chars("ééé", 3), "ééé");
    }
}
