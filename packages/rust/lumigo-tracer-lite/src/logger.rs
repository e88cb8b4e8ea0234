//! Logging utilities for lumigo-tracer-lite.
//!
//! The tracer must stay silent unless asked otherwise: diagnostics are only printed
//! when `LUMIGO_DEBUG=true`. Without it, only `critical` messages reach stderr.
//!
//! # Example
//! ```
//! use lumigo_tracer_lite::logger::Logger;
//!
//! // Define a static logger for your module
//! static LOGGER: Logger = Logger::const_new("my_module");
//!
//! LOGGER.debug("only printed with LUMIGO_DEBUG=true");
//! ```

use crate::constants::env_vars;
use std::env;
use std::sync::OnceLock;

// Prefix of every diagnostic line, so they are easy to tell apart in CloudWatch
const LOG_PREFIX: &str = "#LUMIGO#";

// Prefix of warnings addressed to the function owner
const WARN_CLIENT_PREFIX: &str = "Lumigo Warning";

static DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();

/// Whether `LUMIGO_DEBUG` is set to "true". Read once per process.
fn debug_enabled() -> bool {
    *DEBUG_ENABLED.get_or_init(|| env_flag(env_vars::DEBUG))
}

/// Reads a boolean environment variable. Only a case-insensitive "true" counts.
pub(crate) fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Logger with level filtering and consistent prefixing
#[derive(Clone)]
pub struct Logger {
    prefix: &'static str,
    debug_fn: fn() -> bool,
}

impl Logger {
    /// Create a logger for the given module name
    pub const fn const_new(prefix: &'static str) -> Self {
        Self {
            prefix,
            debug_fn: debug_enabled,
        }
    }

    fn should_log(&self, level: &str) -> bool {
        if (self.debug_fn)() {
            matches!(level, "critical" | "error" | "warn" | "info" | "debug")
        } else {
            level == "critical"
        }
    }

    fn format_message(&self, level: &str, message: &str) -> String {
        format!(
            "{} - {} - [{}] {}",
            LOG_PREFIX,
            level.to_uppercase(),
            self.prefix,
            message
        )
    }

    fn emit(&self, level: &str, message: &str) {
        if self.should_log(level) {
            eprintln!("{}", self.format_message(level, message));
        }
    }

    /// Log a debug message
    pub fn debug(&self, message: impl AsRef<str>) {
        self.emit("debug", message.as_ref());
    }

    /// Log an info message
    pub fn info(&self, message: impl AsRef<str>) {
        self.emit("info", message.as_ref());
    }

    /// Log a warning message
    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit("warn", message.as_ref());
    }

    /// Log an error message
    pub fn error(&self, message: impl AsRef<str>) {
        self.emit("error", message.as_ref());
    }

    /// Log a message that is printed even without `LUMIGO_DEBUG`
    pub fn critical(&self, message: impl AsRef<str>) {
        self.emit("critical", message.as_ref());
    }
}

/// Prints a warning meant for the function owner, unless `LUMIGO_WARNINGS=off`.
pub fn warn_client(message: impl AsRef<str>) {
    if env::var(env_vars::WARNINGS).as_deref() != Ok("off") {
        println!("{}: {}", WARN_CLIENT_PREFIX, message.as_ref());
    }
}
