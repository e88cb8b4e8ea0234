//! Trigger event reduction and classification.
//!
//! Incoming Lambda events are often large and mostly boilerplate. Before an event is
//! stored in the function span it is reduced to the fields that matter for the
//! trigger type, in a stable order, and classified so the backend can link the
//! invocation to whatever triggered it.
//!
//! # Reduction
//!
//! Recognized shapes are tried in a fixed order and the first match wins:
//!
//! 1. API Gateway REST (v1) proxy events
//! 2. API Gateway HTTP (v2) events
//! 3. SNS batches
//! 4. SQS batches
//!
//! Anything else is stored as is.
//!
//! # Classification
//!
//! | Trigger | `triggeredBy` | `messageId` |
//! |---|---|---|
//! | API Gateway | `apigw` | `requestContext.requestId` |
//! | SNS | `sns` | `Sns.MessageId` of the first record |
//! | SQS | `sqs` | `messageId` of the first record |
//! | S3 | `s3` | `responseElements.x-amz-request-id` |
//! | Kinesis | `kinesis` | `kinesis.sequenceNumber` |
//! | DynamoDB Streams | `dynamodb` | none |
//! | EventBridge | `eventBridge` | `id` |
//! | Step Functions (opt-in) | `stepFunction` | `_lumigo.step_function_uid` |
//! | anything else | `unknown` | none |

use crate::constants::span_keys;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::{self, Display};

// Header prefixes that carry no information about the request itself
const FILTERED_HEADER_PREFIXES: &[&str] = &["accept", "cloudfront-", "sec-fetch-", "x-forwarded-"];
const FILTERED_HEADERS: &[&str] = &["via", "x-amz-cf-id", "x-amzn-trace-id"];

/// A recognized event shape with its reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventShape {
    ApiGatewayV1,
    ApiGatewayV2,
    Sns,
    Sqs,
}

impl EventShape {
    /// All shapes in the order they are tried.
    pub const ALL: [EventShape; 4] = [
        EventShape::ApiGatewayV1,
        EventShape::ApiGatewayV2,
        EventShape::Sns,
        EventShape::Sqs,
    ];

    pub fn matches(self, event: &Value) -> bool {
        match self {
            Self::ApiGatewayV1 => {
                event.get("httpMethod").is_some() && event.get("requestContext").is_some()
            }
            Self::ApiGatewayV2 => {
                event.get("version").and_then(Value::as_str) == Some("2.0")
                    && event.pointer("/requestContext/http").is_some()
            }
            Self::Sns => first_record_source(event, "EventSource") == Some("aws:sns"),
            Self::Sqs => first_record_source(event, "eventSource") == Some("aws:sqs"),
        }
    }

    pub fn reduce(self, event: &Value) -> Value {
        let mut reduced = Map::new();
        match self {
            Self::ApiGatewayV1 => {
                copy_keys(
                    event,
                    &mut reduced,
                    &["resource", "path", "httpMethod", "queryStringParameters", "pathParameters", "body"],
                );
                if let Some(authorizer) = event.pointer("/requestContext/authorizer") {
                    let mut context = Map::new();
                    context.insert("authorizer".to_string(), authorizer.clone());
                    reduced.insert("requestContext".to_string(), Value::Object(context));
                }
                insert_filtered_headers(event, &mut reduced);
                copy_keys(event, &mut reduced, &["stageVariables", "isBase64Encoded"]);
            }
            Self::ApiGatewayV2 => {
                copy_keys(event, &mut reduced, &["version", "routeKey", "rawPath"]);
                if let Some(http) = event.pointer("/requestContext/http") {
                    let mut context = Map::new();
                    context.insert("http".to_string(), http.clone());
                    reduced.insert("requestContext".to_string(), Value::Object(context));
                }
                insert_filtered_headers(event, &mut reduced);
                copy_keys(
                    event,
                    &mut reduced,
                    &["cookies", "queryStringParameters", "body", "isBase64Encoded"],
                );
            }
            Self::Sns => {
                let records = records(event)
                    .iter()
                    .map(|record| {
                        let mut sns = Map::new();
                        if let Some(source) = record.get("Sns") {
                            copy_keys(source, &mut sns, &["Message", "MessageAttributes", "MessageId"]);
                        }
                        let mut reduced_record = Map::new();
                        reduced_record.insert("Sns".to_string(), Value::Object(sns));
                        Value::Object(reduced_record)
                    })
                    .collect();
                reduced.insert("Records".to_string(), Value::Array(records));
            }
            Self::Sqs => {
                let records = records(event)
                    .iter()
                    .map(|record| {
                        let mut reduced_record = Map::new();
                        copy_keys(record, &mut reduced_record, &["body", "messageAttributes", "messageId"]);
                        Value::Object(reduced_record)
                    })
                    .collect();
                reduced.insert("Records".to_string(), Value::Array(records));
            }
        }
        Value::Object(reduced)
    }
}

fn records(event: &Value) -> &[Value] {
    event
        .get("Records")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn first_record_source<'a>(event: &'a Value, key: &str) -> Option<&'a str> {
    records(event).first()?.get(key)?.as_str()
}

fn copy_keys(source: &Value, target: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        if let Some(value) = source.get(*key) {
            target.insert((*key).to_string(), value.clone());
        }
    }
}

fn is_filtered_header(name: &str) -> bool {
    let name = name.to_lowercase();
    FILTERED_HEADERS.contains(&name.as_str())
        || FILTERED_HEADER_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn insert_filtered_headers(event: &Value, target: &mut Map<String, Value>) {
    if let Some(Value::Object(headers)) = event.get("headers") {
        let kept: Map<String, Value> = headers
            .iter()
            .filter(|(name, _)| !is_filtered_header(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        target.insert("headers".to_string(), Value::Object(kept));
    }
}

/// Reduces `event` with the first matching shape, or returns it unchanged.
pub fn parse_event(event: &Value) -> Value {
    parse_event_with(event, &EventShape::ALL)
}

/// Like [`parse_event`] with an explicit list of shapes.
pub fn parse_event_with(event: &Value, shapes: &[EventShape]) -> Value {
    shapes
        .iter()
        .find(|shape| shape.matches(event))
        .map(|shape| shape.reduce(event))
        .unwrap_or_else(|| event.clone())
}

/// What invoked the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum TriggerType {
    #[serde(rename = "apigw")]
    ApiGateway,
    #[serde(rename = "sns")]
    Sns,
    #[serde(rename = "sqs")]
    Sqs,
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "kinesis")]
    Kinesis,
    #[serde(rename = "dynamodb")]
    DynamoDb,
    #[serde(rename = "eventBridge")]
    EventBridge,
    #[serde(rename = "stepFunction")]
    StepFunction,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerType::ApiGateway => "apigw",
            TriggerType::Sns => "sns",
            TriggerType::Sqs => "sqs",
            TriggerType::S3 => "s3",
            TriggerType::Kinesis => "kinesis",
            TriggerType::DynamoDb => "dynamodb",
            TriggerType::EventBridge => "eventBridge",
            TriggerType::StepFunction => "stepFunction",
            TriggerType::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Trigger classification stored in the function span's `info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerInfo {
    #[serde(rename = "triggeredBy")]
    pub triggered_by: TriggerType,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    #[serde(rename = "httpMethod", skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl TriggerInfo {
    fn new(triggered_by: TriggerType, message_id: Option<&Value>) -> Self {
        Self {
            triggered_by,
            message_id: message_id.and_then(value_to_string),
            ..Self::default()
        }
    }

    fn with_arn(mut self, arn: Option<&Value>) -> Self {
        self.arn = arn.and_then(value_to_string);
        self
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Classifies the raw (unreduced) event.
///
/// The step function marker is only honored when `step_function` mode is on.
pub fn classify_trigger(event: &Value, step_function: bool) -> TriggerInfo {
    if !event.is_object() {
        return TriggerInfo::default();
    }

    if step_function {
        let uid = event
            .get(span_keys::LUMIGO_EVENT_KEY)
            .and_then(|lumigo| lumigo.get(span_keys::STEP_FUNCTION_UID_KEY));
        if uid.is_some() {
            return TriggerInfo::new(TriggerType::StepFunction, uid);
        }
    }

    if event.pointer("/requestContext/domainName").is_some()
        && event.pointer("/requestContext/requestId").is_some()
    {
        let mut info = TriggerInfo::new(
            TriggerType::ApiGateway,
            event.pointer("/requestContext/requestId"),
        );
        info.http_method = event
            .get("httpMethod")
            .or_else(|| event.pointer("/requestContext/http/method"))
            .and_then(value_to_string);
        info.resource = event
            .get("resource")
            .or_else(|| event.get("routeKey"))
            .and_then(value_to_string);
        info.api = event.pointer("/requestContext/domainName").and_then(value_to_string);
        info.stage = event.pointer("/requestContext/stage").and_then(value_to_string);
        return info;
    }

    if let Some(record) = records(event).first() {
        let source = record
            .get("eventSource")
            .or_else(|| record.get("EventSource"))
            .and_then(Value::as_str);
        let info = match source {
            Some("aws:sns") => TriggerInfo::new(TriggerType::Sns, record.pointer("/Sns/MessageId"))
                .with_arn(record.pointer("/Sns/TopicArn")),
            Some("aws:sqs") => TriggerInfo::new(TriggerType::Sqs, record.get("messageId"))
                .with_arn(record.get("eventSourceARN")),
            Some("aws:s3") => TriggerInfo::new(
                TriggerType::S3,
                record.pointer("/responseElements/x-amz-request-id"),
            )
            .with_arn(record.pointer("/s3/bucket/arn")),
            Some("aws:kinesis") => TriggerInfo::new(
                TriggerType::Kinesis,
                record.pointer("/kinesis/sequenceNumber"),
            )
            .with_arn(record.get("eventSourceARN")),
            Some("aws:dynamodb") => TriggerInfo::new(TriggerType::DynamoDb, None)
                .with_arn(record.get("eventSourceARN")),
            _ => TriggerInfo::default(),
        };
        return info;
    }

    if event.get("detail-type").is_some() && event.get("source").is_some() {
        return TriggerInfo::new(TriggerType::EventBridge, event.get("id"));
    }

    TriggerInfo::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api_gw_v1_event() -> Value {
        json!({
            "resource": "/add-user",
            "path": "/add-user",
            "httpMethod": "POST",
            "headers": {
                "Accept": "application/json",
                "Accept-Encoding": "gzip",
                "Authorization": "auth",
                "CloudFront-Viewer-Country": "IL",
                "content-type": "application/json",
                "Host": "aaaa.execute-api.us-west-2.amazonaws.com",
                "sec-fetch-mode": "cors",
                "Via": "2.0 cloudfront",
                "X-Amz-Cf-Id": "id",
                "X-Amzn-Trace-Id": "Root=1",
                "X-Forwarded-For": "5.102.206.161"
            },
            "multiValueHeaders": {"Accept": ["application/json"]},
            "queryStringParameters": "1",
            "multiValueQueryStringParameters": "1",
            "pathParameters": "1",
            "stageVariables": null,
            "requestContext": {
                "resourceId": "ua33sn",
                "authorizer": {"claims": {"sub": "a8"}},
                "stage": "prod",
                "requestId": "78542821",
                "domainName": "psqn7b0ev2.execute-api.us-west-2.amazonaws.com"
            },
            "body": "{\"email\":\"a@a.com\"}",
            "isBase64Encoded": false
        })
    }

    #[test]
    fn test_api_gateway_v1_reduction() {
        let reduced = parse_event(&api_gw_v1_event());

        let expected = json!({
            "resource": "/add-user",
            "path": "/add-user",
            "httpMethod": "POST",
            "queryStringParameters": "1",
            "pathParameters": "1",
            "body": "{\"email\":\"a@a.com\"}",
            "requestContext": {"authorizer": {"claims": {"sub": "a8"}}},
            "headers": {
                "Authorization": "auth",
                "content-type": "application/json",
                "Host": "aaaa.execute-api.us-west-2.amazonaws.com"
            },
            "stageVariables": null,
            "isBase64Encoded": false
        });
        // Compare the encodings so key order is checked too.
        assert_eq!(reduced.to_string(), expected.to_string());
    }

    #[test]
    fn test_api_gateway_v2_reduction() {
        let event = json!({
            "version": "2.0",
            "routeKey": "ANY /fn",
            "rawPath": "/default/fn",
            "rawQueryString": "",
            "cookies": ["s_fid=7A"],
            "headers": {
                "accept": "text/html",
                "content-length": "0",
                "host": "r3pmxmplak.execute-api.us-east-2.amazonaws.com",
                "sec-fetch-user": "?1",
                "upgrade-insecure-requests": "1",
                "x-forwarded-port": "443"
            },
            "requestContext": {
                "accountId": "123456789012",
                "http": {"method": "GET", "path": "/default/fn"},
                "requestId": "JKJaXmPLvHcESHA="
            },
            "isBase64Encoded": true
        });

        let reduced = parse_event(&event);

        let expected = json!({
            "version": "2.0",
            "routeKey": "ANY /fn",
            "rawPath": "/default/fn",
            "requestContext": {"http": {"method": "GET", "path": "/default/fn"}},
            "headers": {
                "content-length": "0",
                "host": "r3pmxmplak.execute-api.us-east-2.amazonaws.com",
                "upgrade-insecure-requests": "1"
            },
            "cookies": ["s_fid=7A"],
            "isBase64Encoded": true
        });
        assert_eq!(reduced.to_string(), expected.to_string());
    }

    #[test]
    fn test_sns_reduction() {
        let event = json!({"Records": [{
            "EventSource": "aws:sns",
            "EventVersion": "1.0",
            "Sns": {
                "Signature": "tcc6",
                "MessageId": "95df01b4",
                "Message": "Hello from SNS1!",
                "MessageAttributes": {"Test": {"Type": "String", "Value": "TestString"}},
                "TopicArn": "arn:aws:sns:us-east-2:123456789012:sns-lambda"
            }
        }]});

        let reduced = parse_event(&event);

        let expected = json!({"Records": [{"Sns": {
            "Message": "Hello from SNS1!",
            "MessageAttributes": {"Test": {"Type": "String", "Value": "TestString"}},
            "MessageId": "95df01b4"
        }}]});
        assert_eq!(reduced.to_string(), expected.to_string());
    }

    #[test]
    fn test_sqs_reduction() {
        let event = json!({"Records": [
            {"messageId": "059f", "receiptHandle": "AQEB", "body": "Test message1",
             "messageAttributes": {"a": 1}, "eventSource": "aws:sqs"},
            {"messageId": "2e14", "receiptHandle": "AQEB", "body": "Test message2",
             "messageAttributes": {"b": 2}, "eventSource": "aws:sqs"}
        ]});

        let reduced = parse_event(&event);

        let expected = json!({"Records": [
            {"body": "Test message1", "messageAttributes": {"a": 1}, "messageId": "059f"},
            {"body": "Test message2", "messageAttributes": {"b": 2}, "messageId": "2e14"}
        ]});
        assert_eq!(reduced.to_string(), expected.to_string());
    }

    #[test]
    fn test_unrecognized_event_passes_through() {
        let event = json!({"a": 1});
        assert_eq!(parse_event(&event), event);
        assert_eq!(parse_event(&Value::Null), Value::Null);
        assert_eq!(parse_event_with(&api_gw_v1_event(), &[]), api_gw_v1_event());
    }

    #[test]
    fn test_classify_api_gateway() {
        let info = classify_trigger(&api_gw_v1_event(), false);

        assert_eq!(info.triggered_by, TriggerType::ApiGateway);
        assert_eq!(info.message_id.as_deref(), Some("78542821"));
        assert_eq!(info.http_method.as_deref(), Some("POST"));
        assert_eq!(info.stage.as_deref(), Some("prod"));
    }

    #[test]
    fn test_classify_records() {
        let cases = [
            (json!({"Records": [{"eventSource": "aws:sqs", "messageId": "m1"}]}), TriggerType::Sqs, Some("m1")),
            (json!({"Records": [{"EventSource": "aws:sns", "Sns": {"MessageId": "m2"}}]}), TriggerType::Sns, Some("m2")),
            (
                json!({"Records": [{"eventSource": "aws:s3", "responseElements": {"x-amz-request-id": "m3"}}]}),
                TriggerType::S3,
                Some("m3"),
            ),
            (
                json!({"Records": [{"eventSource": "aws:kinesis", "kinesis": {"sequenceNumber": "m4"}}]}),
                TriggerType::Kinesis,
                Some("m4"),
            ),
            (json!({"Records": [{"eventSource": "aws:dynamodb"}]}), TriggerType::DynamoDb, None),
            (json!({"Records": [{"eventSource": "aws:other"}]}), TriggerType::Unknown, None),
        ];
        for (event, expected, message_id) in cases {
            let info = classify_trigger(&event, false);
            assert_eq!(info.triggered_by, expected);
            assert_eq!(info.message_id.as_deref(), message_id);
        }
    }

    #[test]
    fn test_classify_event_bridge() {
        let event = json!({"id": "eb-1", "detail-type": "Scheduled Event", "source": "aws.events"});
        let info = classify_trigger(&event, false);
        assert_eq!(info.triggered_by, TriggerType::EventBridge);
        assert_eq!(info.message_id.as_deref(), Some("eb-1"));
    }

    #[test]
    fn test_classify_step_function_only_in_step_function_mode() {
        let event = json!({"result": 1, "_lumigo": {"step_function_uid": "123"}});

        let info = classify_trigger(&event, true);
        assert_eq!(info.triggered_by, TriggerType::StepFunction);
        assert_eq!(info.message_id.as_deref(), Some("123"));

        assert_eq!(classify_trigger(&event, false).triggered_by, TriggerType::Unknown);
        assert_eq!(classify_trigger(&json!({}), true).triggered_by, TriggerType::Unknown);
    }

    #[test]
    fn test_trigger_info_serialization() {
        let info = TriggerInfo::new(TriggerType::Sqs, Some(&json!("m1")));
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"triggeredBy": "sqs", "messageId": "m1"})
        );
        assert_eq!(TriggerType::EventBridge.to_string(), "eventBridge");
    }
}
