//! Constants for the lumigo-tracer-lite package.
//!
//! This file centralizes all constants to ensure consistency across the codebase
//! and provide a single source of truth for configuration parameters.

/// Environment variable names for configuration.
pub mod env_vars {
    /// Edge host override. Leave unset to use the region-templated default.
    pub const TRACER_HOST: &str = "LUMIGO_TRACER_HOST";

    /// Token embedded in every function span.
    pub const TRACER_TOKEN: &str = "LUMIGO_TRACER_TOKEN";

    /// Set to "false" to stop capturing HTTP headers and bodies.
    pub const VERBOSE: &str = "LUMIGO_VERBOSE";

    /// Set to "true" to prefix log lines with the request id.
    pub const ENHANCED_PRINT: &str = "LUMIGO_ENHANCED_PRINT";

    /// Set to "true" when the function is a step function state.
    pub const STEP_FUNCTION: &str = "LUMIGO_STEP_FUNCTION";

    /// Set to "false" to disable the deadline guard.
    pub const TIMEOUT_TIMER: &str = "LUMIGO_TIMEOUT_TIMER";

    /// Seconds reserved before the Lambda deadline for the forced report.
    pub const TIMEOUT_BUFFER: &str = "LUMIGO_TIMEOUT_BUFFER";

    /// Only report invocations that ended with an error.
    pub const SEND_ONLY_IF_ERROR: &str = "SEND_ONLY_IF_ERROR";

    /// JSON array of host regexes whose traffic is never captured.
    pub const DOMAINS_SCRUBBER: &str = "LUMIGO_DOMAINS_SCRUBBER";

    /// JSON array of key regexes whose values are masked.
    pub const SECRET_MASKING_REGEX: &str = "LUMIGO_SECRET_MASKING_REGEX";

    /// Deprecated name of [`SECRET_MASKING_REGEX`].
    pub const SECRET_MASKING_REGEX_BACKWARD_COMP: &str = "LUMIGO_BLACKLIST_REGEX";

    /// Set to "true" to send every span regardless of the request size cap.
    pub const PRUNE_TRACE_OFF: &str = "LUMIGO_PRUNE_TRACE_OFF";

    /// Maximum base64-encoded size of one report, in bytes.
    pub const MAX_SIZE_FOR_REQUEST: &str = "LUMIGO_MAX_SIZE_FOR_REQUEST";

    /// Reporter network timeout, in seconds.
    pub const EDGE_TIMEOUT: &str = "LUMIGO_EDGE_TIMEOUT";

    /// Set to "true" to print the tracer's own diagnostics.
    pub const DEBUG: &str = "LUMIGO_DEBUG";

    /// Set to "off" to silence client warnings.
    pub const WARNINGS: &str = "LUMIGO_WARNINGS";

    /// Kill switch. When "true" the handler runs untraced.
    pub const SWITCH_OFF: &str = "LUMIGO_SWITCH_OFF";

    /// Controls whether to install a fmt layer for `tracing` output.
    pub const ENABLE_FMT_LAYER: &str = "LUMIGO_TRACING_ENABLE_FMT_LAYER";

    /// Present only inside the Lambda execution environment.
    pub const LAMBDA_RUNTIME_DIR: &str = "LAMBDA_RUNTIME_DIR";

    /// AWS region of the function.
    pub const AWS_REGION: &str = "AWS_REGION";

    /// AWS Lambda function name.
    pub const AWS_LAMBDA_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";

    /// AWS Lambda function version.
    pub const AWS_LAMBDA_FUNCTION_VERSION: &str = "AWS_LAMBDA_FUNCTION_VERSION";

    /// Configured memory, in MB.
    pub const AWS_LAMBDA_FUNCTION_MEMORY_SIZE: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";

    /// CloudWatch log group of the function.
    pub const AWS_LAMBDA_LOG_GROUP_NAME: &str = "AWS_LAMBDA_LOG_GROUP_NAME";

    /// CloudWatch log stream of the execution environment.
    pub const AWS_LAMBDA_LOG_STREAM_NAME: &str = "AWS_LAMBDA_LOG_STREAM_NAME";

    /// Runtime identifier, e.g. `AWS_Lambda_rust`.
    pub const AWS_EXECUTION_ENV: &str = "AWS_EXECUTION_ENV";
}

/// Default values for configuration parameters.
pub mod defaults {
    /// Region-templated edge endpoint.
    pub const EDGE_HOST: &str = "https://{region}.lumigo-tracer-edge.golumigo.com/api/spans";

    /// Reporter network timeout, in seconds.
    pub const EDGE_TIMEOUT_SECS: f64 = 0.5;

    /// Maximum base64-encoded size of one report.
    pub const MAX_SIZE_FOR_REQUEST: usize = 900_000;

    /// Number of spans that may fail to fit before pruning stops scanning.
    pub const TOO_BIG_SPANS_THRESHOLD: usize = 5;

    /// Span count from which pruning is considered even for small reports.
    pub const NUMBER_OF_SPANS_IN_REPORT_OPTIMIZATION: usize = 200;

    /// Total byte budget for captured stack frames.
    pub const MAX_VARS_SIZE: usize = 100_000;

    /// Maximum rendered length of one local variable.
    pub const MAX_VAR_LEN: usize = 200;

    /// Maximum rendered length of an event, return value, header block or body.
    pub const MAX_ENTRY_SIZE: usize = 2048;

    /// Lower bound of the computed deadline buffer, in seconds.
    pub const MIN_TIMEOUT_BUFFER_SECS: f64 = 0.5;

    /// Upper bound of the computed deadline buffer, in seconds.
    pub const MAX_TIMEOUT_BUFFER_SECS: f64 = 3.0;

    /// Share of the remaining time reserved as deadline buffer.
    pub const TIMEOUT_BUFFER_RATIO: f64 = 0.1;

    /// Maximum number of execution tags per invocation.
    pub const MAX_TAGS: usize = 50;

    /// Maximum execution tag key length.
    pub const MAX_TAG_KEY_LEN: usize = 50;

    /// Maximum execution tag value length.
    pub const MAX_TAG_VALUE_LEN: usize = 70;

    /// Key patterns masked when no override is configured.
    pub const OMITTING_KEYS_REGEXES: &[&str] = &[
        ".*pass.*",
        ".*key.*",
        ".*secret.*",
        ".*credential.*",
        "SessionToken",
        "x-amz-security-token",
        "Signature",
        "Authorization",
    ];

    /// Hosts whose traffic is never captured when no override is configured.
    pub const DOMAIN_SCRUBBER_REGEXES: &[&str] = &[
        r"secretsmanager\..*\.amazonaws\.com",
        r"ssm\..*\.amazonaws\.com",
        r"kms\..*\.amazonaws\.com",
        r"sts\..*amazonaws\.com",
    ];
}

/// Keys and markers that appear in reported spans.
pub mod span_keys {
    /// Carrier key of the execution tags. Never scrubbed.
    pub const EXECUTION_TAGS_KEY: &str = "lumigo_execution_tags_no_scrub";

    /// Keys that the redactor passes through untouched.
    pub const SKIP_SCRUBBING_KEYS: &[&str] = &[EXECUTION_TAGS_KEY];

    /// Replacement for masked values.
    pub const MASK: &str = "****";

    /// Suffix of the function span id while the invocation is open.
    pub const STARTED_SUFFIX: &str = "_started";

    /// Appended to truncated values.
    pub const TOO_LONG_MARKER: &str = "...[too long]";

    /// Body placeholder for scrubbed or non-verbose HTTP spans.
    pub const DATA_NOT_AVAILABLE: &str = "The data is not available";

    /// Event key carrying tracer metadata between step function states.
    pub const LUMIGO_EVENT_KEY: &str = "_lumigo";

    /// Step function correlation id under [`LUMIGO_EVENT_KEY`].
    pub const STEP_FUNCTION_UID_KEY: &str = "step_function_uid";

    /// Error type recorded when the return value cannot be serialized.
    pub const RETURN_VALUE_ERROR: &str = "ReturnValueError";

    /// Error type recorded when the handler panics.
    pub const PANIC_ERROR: &str = "Panic";
}
