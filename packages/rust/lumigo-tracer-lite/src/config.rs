//! Tracer configuration.
//!
//! Configuration comes from two places: programmatic [`TracerOptions`] passed to
//! [`init_tracer`](crate::init_tracer), and environment variables. They are resolved
//! once into a [`TracerConfig`].
//!
//! # Precedence
//!
//! - `should_report`: an explicit option wins. Otherwise reporting is on inside
//!   Lambda (`LAMBDA_RUNTIME_DIR` is set) and off elsewhere.
//! - `edge_host` / `token`: the option wins over `LUMIGO_TRACER_HOST` /
//!   `LUMIGO_TRACER_TOKEN`.
//! - `verbose` / `timeout_timer`: on only if the option is on *and* the environment
//!   variable is not "false".
//! - `enhance_print` / `step_function`: on if either the option or the environment
//!   variable is.
//! - `timeout_timer_buffer`: `LUMIGO_TIMEOUT_BUFFER` wins over the option. A value
//!   that is not a number is reported and ignored.
//! - `domains_scrubber`: a non-empty option wins over `LUMIGO_DOMAINS_SCRUBBER`. A
//!   malformed environment value turns reporting off.
//!
//! # Example
//!
//! ```
//! use lumigo_tracer_lite::{TracerConfig, TracerOptions};
//!
//! let options = TracerOptions::builder()
//!     .token("t_123".to_string())
//!     .should_report(false)
//!     .timeout_timer_buffer(1.5)
//!     .build();
//! let config = TracerConfig::resolve(&options);
//! assert!(!config.should_report);
//! ```

use crate::constants::{defaults, env_vars};
use crate::error::TracerError;
use crate::logger::{env_flag, warn_client, Logger};
use crate::redact::{anchored_pattern, parse_pattern_list, Redactor};
use bon::Builder;
use regex::Regex;
use std::env;
use std::sync::Arc;
use std::time::Duration;

static LOGGER: Logger = Logger::const_new("config");

/// Programmatic overrides. Everything left unset falls back to the environment.
#[derive(Builder, Debug, Clone)]
pub struct TracerOptions {
    /// Token embedded in every function span.
    pub token: Option<String>,

    /// Edge host. Leave unset for the region default.
    pub edge_host: Option<String>,

    /// Force reporting on or off.
    pub should_report: Option<bool>,

    /// Capture HTTP headers and bodies.
    ///
    /// Default: `true`
    #[builder(default = true)]
    pub verbose: bool,

    /// Prefix log lines with the request id.
    ///
    /// Default: `false`
    #[builder(default = false)]
    pub enhance_print: bool,

    /// The function is a step function state.
    ///
    /// Default: `false`
    #[builder(default = false)]
    pub step_function: bool,

    /// Report before the Lambda deadline.
    ///
    /// Default: `true`
    #[builder(default = true)]
    pub timeout_timer: bool,

    /// Seconds reserved before the deadline. Computed from the remaining time when unset.
    pub timeout_timer_buffer: Option<f64>,

    /// Regexes of hosts whose traffic is never captured in detail.
    pub domains_scrubber: Option<Vec<String>>,

    /// Install a `tracing` fmt layer for the tracer's own events.
    ///
    /// Default: `false`
    #[builder(default = false)]
    pub enable_fmt_layer: bool,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub should_report: bool,
    pub host: Option<String>,
    pub token: String,
    pub verbose: bool,
    pub enhanced_print: bool,
    pub step_function: bool,
    pub timeout_timer: bool,
    pub timeout_timer_buffer: Option<f64>,
    pub send_only_if_error: bool,
    pub domains_scrubber: Vec<Regex>,
    pub redactor: Arc<Redactor>,
    pub edge_timeout: Duration,
    pub switch_off: bool,
    pub enable_fmt_layer: bool,
}

/// Whether the process runs inside the Lambda execution environment.
pub fn is_aws_environment() -> bool {
    env::var(env_vars::LAMBDA_RUNTIME_DIR).is_ok_and(|v| !v.is_empty())
}

fn env_not_false(name: &str) -> bool {
    env::var(name).map_or(true, |v| !v.eq_ignore_ascii_case("false"))
}

fn compile_host_patterns<S: AsRef<str>>(patterns: &[S]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            let p = p.as_ref();
            match anchored_pattern(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    LOGGER.warn(format!("Skipping invalid domain pattern {p:?}: {e}"));
                    None
                }
            }
        })
        .collect()
}

/// Parses a non-negative number of seconds read from the variable `name`.
fn parse_seconds(name: &'static str, raw: &str) -> Result<f64, TracerError> {
    let seconds = raw.trim().parse::<f64>().map_err(|e| TracerError::Config {
        name,
        reason: format!("{raw:?} is not a number: {e}"),
    })?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(TracerError::Config {
            name,
            reason: format!("{raw:?} is not a non-negative number of seconds"),
        });
    }
    Ok(seconds)
}

fn resolve_timeout_buffer(option: Option<f64>) -> Option<f64> {
    match env::var(env_vars::TIMEOUT_BUFFER) {
        Ok(raw) => match parse_seconds(env_vars::TIMEOUT_BUFFER, &raw) {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                LOGGER.debug(e.to_string());
                warn_client("Could not configure LUMIGO_TIMEOUT_BUFFER. Using default value.");
                None
            }
        },
        Err(_) => option,
    }
}

fn resolve_edge_timeout() -> Duration {
    let seconds = match env::var(env_vars::EDGE_TIMEOUT) {
        Ok(raw) => parse_seconds(env_vars::EDGE_TIMEOUT, &raw).unwrap_or_else(|e| {
            LOGGER.warn(format!("{e}, using default"));
            defaults::EDGE_TIMEOUT_SECS
        }),
        Err(_) => defaults::EDGE_TIMEOUT_SECS,
    };
    Duration::try_from_secs_f64(seconds)
        .unwrap_or_else(|_| Duration::from_secs_f64(defaults::EDGE_TIMEOUT_SECS))
}

/// The scrubber patterns, or `None` when the environment value is malformed.
fn resolve_domains_scrubber(option: Option<&[String]>) -> Option<Vec<Regex>> {
    if let Some(patterns) = option.filter(|p| !p.is_empty()) {
        return Some(compile_host_patterns(patterns));
    }
    match env::var(env_vars::DOMAINS_SCRUBBER) {
        Ok(raw) => match parse_pattern_list(&raw) {
            Ok(patterns) => Some(compile_host_patterns(&patterns)),
            Err(e) => {
                LOGGER.debug(format!("{}: {e}", env_vars::DOMAINS_SCRUBBER));
                None
            }
        },
        Err(_) => Some(compile_host_patterns(defaults::DOMAIN_SCRUBBER_REGEXES)),
    }
}

impl TracerConfig {
    /// Resolves `options` against the environment.
    pub fn resolve(options: &TracerOptions) -> Self {
        let mut should_report = options.should_report.unwrap_or_else(is_aws_environment);

        let domains_scrubber = resolve_domains_scrubber(options.domains_scrubber.as_deref())
            .unwrap_or_else(|| {
                LOGGER.critical(
                    "Could not parse the specified domains scrubber, shutting down the reporter.",
                );
                should_report = false;
                Vec::new()
            });

        let host = options
            .edge_host
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| env::var(env_vars::TRACER_HOST).ok())
            .filter(|h| !h.is_empty());

        let token = options
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| env::var(env_vars::TRACER_TOKEN).ok())
            .unwrap_or_default();

        Self {
            should_report,
            host,
            token,
            verbose: options.verbose && env_not_false(env_vars::VERBOSE),
            enhanced_print: options.enhance_print || env_flag(env_vars::ENHANCED_PRINT),
            step_function: options.step_function || env_flag(env_vars::STEP_FUNCTION),
            timeout_timer: options.timeout_timer && env_not_false(env_vars::TIMEOUT_TIMER),
            timeout_timer_buffer: resolve_timeout_buffer(options.timeout_timer_buffer),
            send_only_if_error: env_flag(env_vars::SEND_ONLY_IF_ERROR),
            domains_scrubber,
            redactor: Arc::new(Redactor::from_env()),
            edge_timeout: resolve_edge_timeout(),
            switch_off: env_flag(env_vars::SWITCH_OFF),
            enable_fmt_layer: options.enable_fmt_layer || env_flag(env_vars::ENABLE_FMT_LAYER),
        }
    }

    /// Configuration from the environment alone.
    pub fn from_env() -> Self {
        Self::resolve(&TracerOptions::default())
    }
}
