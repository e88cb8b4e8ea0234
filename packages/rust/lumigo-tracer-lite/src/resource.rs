//! Function metadata for the function span.
//!
//! The Lambda runtime exposes most of what identifies a function through environment
//! variables. The account id is only available in the invoked function ARN, so it is
//! filled in per invocation.
//!
//! | Field | Source |
//! |---|---|
//! | `name` | `AWS_LAMBDA_FUNCTION_NAME` |
//! | `region` | `AWS_REGION`, else the invoked ARN |
//! | `account` | invoked function ARN |
//! | `memoryAllocated` | `AWS_LAMBDA_FUNCTION_MEMORY_SIZE` |
//! | `runtime` | `AWS_EXECUTION_ENV` |
//! | `version` | `AWS_LAMBDA_FUNCTION_VERSION` |
//! | `logGroupName` | `AWS_LAMBDA_LOG_GROUP_NAME` |
//! | `logStreamName` | `AWS_LAMBDA_LOG_STREAM_NAME` |

use crate::constants::env_vars;
use serde::Serialize;
use std::env;

/// Identity of the running function.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunctionMetadata {
    pub name: String,
    pub region: String,
    pub account: String,
    #[serde(rename = "memoryAllocated")]
    pub memory_allocated: String,
    pub runtime: String,
    pub version: String,
    #[serde(rename = "logGroupName")]
    pub log_group_name: String,
    #[serde(rename = "logStreamName")]
    pub log_stream_name: String,
    #[serde(rename = "invokedArn", skip_serializing_if = "Option::is_none")]
    pub invoked_arn: Option<String>,
}

fn env_or_empty(name: &str) -> String {
    env::var(name).unwrap_or_default()
}

impl FunctionMetadata {
    /// Reads the function identity from the Lambda environment.
    pub fn from_env() -> Self {
        Self {
            name: env_or_empty(env_vars::AWS_LAMBDA_FUNCTION_NAME),
            region: env_or_empty(env_vars::AWS_REGION),
            account: String::new(),
            memory_allocated: env_or_empty(env_vars::AWS_LAMBDA_FUNCTION_MEMORY_SIZE),
            runtime: env_or_empty(env_vars::AWS_EXECUTION_ENV),
            version: env_or_empty(env_vars::AWS_LAMBDA_FUNCTION_VERSION),
            log_group_name: env_or_empty(env_vars::AWS_LAMBDA_LOG_GROUP_NAME),
            log_stream_name: env_or_empty(env_vars::AWS_LAMBDA_LOG_STREAM_NAME),
            invoked_arn: None,
        }
    }

    /// Completes the metadata from the invoked function ARN,
    /// e.g. `arn:aws:lambda:us-east-1:123456789012:function:my-fn`.
    pub fn with_invoked_arn(mut self, arn: &str) -> Self {
        if arn.is_empty() {
            return self;
        }
        let parts: Vec<&str> = arn.split(':').collect();
        if let Some(account) = parts.get(4).filter(|a| !a.is_empty()) {
            self.account = account.to_string();
        }
        if self.region.is_empty() {
            if let Some(region) = parts.get(3) {
                self.region = region.to_string();
            }
        }
        if self.name.is_empty() {
            if let Some(name) = parts.get(6) {
                self.name = name.to_string();
            }
        }
        self.invoked_arn = Some(arn.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_env() {
        env::remove_var(env_vars::AWS_REGION);
        env::remove_var(env_vars::AWS_LAMBDA_FUNCTION_NAME);
        env::remove_var(env_vars::AWS_LAMBDA_FUNCTION_VERSION);
        env::remove_var(env_vars::AWS_LAMBDA_FUNCTION_MEMORY_SIZE);
        env::remove_var(env_vars::AWS_LAMBDA_LOG_GROUP_NAME);
        env::remove_var(env_vars::AWS_LAMBDA_LOG_STREAM_NAME);
        env::remove_var(env_vars::AWS_EXECUTION_ENV);
    }

    #[test]
    #[serial]
    fn test_from_env_with_standard_env() {
        cleanup_env();

        env::set_var(env_vars::AWS_REGION, "us-west-2");
        env::set_var(env_vars::AWS_LAMBDA_FUNCTION_NAME, "test-function");
        env::set_var(env_vars::AWS_LAMBDA_FUNCTION_VERSION, "$LATEST");
        env::set_var(env_vars::AWS_LAMBDA_FUNCTION_MEMORY_SIZE, "128");
        env::set_var(env_vars::AWS_LAMBDA_LOG_GROUP_NAME, "/aws/lambda/test-function");
        env::set_var(env_vars::AWS_LAMBDA_LOG_STREAM_NAME, "2024/01/01/[$LATEST]abc123");

        let metadata = FunctionMetadata::from_env();

        assert_eq!(metadata.region, "us-west-2");
        assert_eq!(metadata.name, "test-function");
        assert_eq!(metadata.version, "$LATEST");
        assert_eq!(metadata.memory_allocated, "128");
        assert_eq!(metadata.log_group_name, "/aws/lambda/test-function");
        assert_eq!(metadata.log_stream_name, "2024/01/01/[$LATEST]abc123");

        cleanup_env();
    }

    #[test]
    #[serial]
    fn test_invoked_arn_fills_account_and_missing_fields() {
        cleanup_env();

        let metadata = FunctionMetadata::from_env()
            .with_invoked_arn("arn:aws:lambda:eu-west-1:123456789012:function:my-fn");

        assert_eq!(metadata.account, "123456789012");
        assert_eq!(metadata.region, "eu-west-1");
        assert_eq!(metadata.name, "my-fn");

        cleanup_env();
    }

    #[test]
    fn test_serialized_field_names() {
        let value = serde_json::to_value(FunctionMetadata::default()).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                "name",
                "region",
                "account",
                "memoryAllocated",
                "runtime",
                "version",
                "logGroupName",
                "logStreamName"
            ]
        );
    }
}
