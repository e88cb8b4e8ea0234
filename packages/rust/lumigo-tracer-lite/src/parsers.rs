//! Service-aware enrichment of HTTP spans.
//!
//! Calls to well-known AWS endpoints carry resource names and message ids that let
//! the backend stitch the invoking function to the downstream resource. The parser
//! is chosen from the host name and adds those fields on top of the generic span.

use crate::span::{HttpRequestData, HttpResponseData};
use md5::{Digest, Md5};
use regex::RegexBuilder;
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{json, Map, Value};
use std::io;

/// Parser selected for one HTTP span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceParser {
    /// Any non-AWS host.
    Generic,
    /// An AWS host without a dedicated parser.
    Aws,
    DynamoDb,
    Sns,
    Lambda,
    Kinesis,
    S3,
    Sqs,
    ApiGatewayV2,
}

impl ServiceParser {
    /// Picks the parser for `host`. Response headers help recognize AWS services
    /// behind custom domains.
    pub fn for_host(host: &str, response_headers: &[(String, String)]) -> Self {
        let service = safe_split_get(host, ".", 0).unwrap_or_default();
        match service {
            "dynamodb" => Self::DynamoDb,
            "sns" => Self::Sns,
            "lambda" => Self::Lambda,
            "kinesis" => Self::Kinesis,
            _ if safe_split_get(host, ".", 1) == Some("s3") => Self::S3,
            "sqs" | "sqs-fips" => Self::Sqs,
            _ if host.contains("queue.amazonaws.com") => Self::Sqs,
            _ if host.contains("execute-api") => Self::ApiGatewayV2,
            _ if host.ends_with("amazonaws.com")
                || header(response_headers, "x-amzn-requestid").is_some() =>
            {
                Self::Aws
            }
            _ => Self::Generic,
        }
    }

    fn is_aws(self) -> bool {
        !matches!(self, Self::Generic | Self::S3)
    }

    /// Fields derived from the request, merged into the span.
    pub fn request_fields(self, host: &str, request: &HttpRequestData) -> Map<String, Value> {
        let body = request.body.as_slice();
        let headers = request.headers.as_deref().unwrap_or_default();
        let fields = match self {
            Self::DynamoDb => {
                let method = header(headers, "x-amz-target")
                    .and_then(|target| safe_split_get(target, ".", 1))
                    .unwrap_or_default()
                    .to_string();
                let parsed: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
                json!({"info": {
                    "resourceName": dynamodb_table_name(&parsed, &method),
                    "dynamodbMethod": method,
                    "messageId": dynamodb_message_id(&parsed, &method),
                }})
            }
            Self::Sns => {
                let topic = key_from_query(body, "TopicArn");
                json!({"info": {"resourceName": topic, "targetArn": topic}})
            }
            Self::Lambda => {
                let path = request.path.as_deref().unwrap_or_default();
                json!({
                    "name": safe_split_get(path, "/", 3),
                    "invocationType": header(headers, "x-amz-invocation-type"),
                })
            }
            Self::Kinesis => json!({"info": {"resourceName": key_from_json(body, "StreamName")}}),
            Self::S3 => json!({"info": {"resourceName": safe_split_get(host, ".", 0)}}),
            Self::Sqs => {
                let queue = key_from_query(body, "QueueUrl")
                    .map(Value::String)
                    .or_else(|| key_from_json(body, "QueueUrl"));
                json!({"info": {"resourceName": queue}})
            }
            Self::Generic | Self::Aws | Self::ApiGatewayV2 => Value::Null,
        };
        into_map(fields)
    }

    /// Fields derived from the response, merged into the span.
    pub fn response_fields(self, response: &HttpResponseData) -> Map<String, Value> {
        let body = response.body.as_slice();
        let headers = response.headers.as_slice();

        let mut fields = Map::new();
        if self.is_aws() {
            let request_id = header(headers, "x-amzn-requestid");
            if let (Some(id), true) = (request_id, self != Self::DynamoDb) {
                merge_into(&mut fields, into_map(json!({"info": {"messageId": id}})));
            }
            if let Some(id) = request_id.or_else(|| header(headers, "x-amz-requestid")) {
                fields.insert("id".to_string(), Value::String(id.to_string()));
            }
        }

        let message_id = match self {
            Self::Sns => key_from_xml(body, "PublishResponse/PublishResult/MessageId").map(Value::String),
            Self::Kinesis => key_from_json(body, "SequenceNumber").or_else(|| {
                key_from_json(body, "Records")
                    .and_then(|records| records.get(0)?.get("SequenceNumber").cloned())
            }),
            Self::Sqs => key_from_xml(body, "SendMessageResponse/SendMessageResult/MessageId")
                .or_else(|| {
                    key_from_xml(
                        body,
                        "SendMessageBatchResponse/SendMessageBatchResult/SendMessageBatchResultEntry/0/MessageId",
                    )
                })
                .map(Value::String)
                .or_else(|| key_from_json(body, "MessageId")),
            Self::S3 => header(headers, "x-amz-request-id").map(|v| Value::String(v.to_string())),
            Self::ApiGatewayV2 => header(headers, "x-amzn-requestid")
                .or_else(|| header(headers, "apigw-requestid"))
                .map(|v| Value::String(v.to_string())),
            Self::Generic | Self::Aws | Self::DynamoDb | Self::Lambda => None,
        };
        if let Some(message_id) = message_id {
            merge_into(&mut fields, into_map(json!({"info": {"messageId": message_id}})));
        }
        fields
    }
}

fn dynamodb_table_name(body: &Value, method: &str) -> Value {
    if let Some(name) = body.get("TableName").filter(|v| !v.is_null()) {
        return name.clone();
    }
    if method == "BatchWriteItem" {
        if let Some(Value::Object(items)) = body.get("RequestItems") {
            if let Some(first) = items.keys().next() {
                return Value::String(first.clone());
            }
        }
    }
    Value::Null
}

/// Hash of the written item, so the stream record it produces can be matched to this call.
///
/// `PutItem` hashes the item, `UpdateItem` and `DeleteItem` the key, and
/// `BatchWriteItem` the first request of the first table.
fn dynamodb_message_id(body: &Value, method: &str) -> Option<String> {
    let present = |v: &&Value| !is_empty_value(v);
    let written = match method {
        "PutItem" => body.get("Item").filter(present)?,
        "UpdateItem" | "DeleteItem" => body.get("Key").filter(present)?,
        "BatchWriteItem" => {
            let (_, requests) = body.get("RequestItems")?.as_object()?.iter().next()?;
            let first = requests.as_array()?.first()?;
            match first.get("PutRequest").filter(present) {
                Some(put) => put.get("Item")?,
                None => first.get("DeleteRequest")?.get("Key")?,
            }
        }
        _ => return None,
    };
    md5_hash(written)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

/// Hex md5 of `value` written as sorted-key JSON, with `", "` and `": "` separators and
/// characters outside printable ASCII escaped as `\uXXXX`.
pub(crate) fn md5_hash(value: &Value) -> Option<String> {
    let mut canonical = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut canonical, CanonicalFormatter);
    sorted_keys(value).serialize(&mut serializer).ok()?;

    let mut hasher = Md5::new();
    hasher.update(&canonical);
    Some(hex::encode(hasher.finalize()))
}

fn sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}

struct CanonicalFormatter;

impl Formatter for CanonicalFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        for c in fragment.chars() {
            if c.is_ascii() && !c.is_ascii_control() {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0_u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Deep-merges `extra` into `target`. Nested objects merge, `null` never overwrites.
pub(crate) fn merge_into(target: &mut Map<String, Value>, extra: Map<String, Value>) {
    for (key, value) in extra {
        match (target.get_mut(&key), value) {
            (_, Value::Null) => {}
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_into(existing, nested),
            (_, Value::Object(nested)) => {
                let mut fresh = Map::new();
                merge_into(&mut fresh, nested);
                if !fresh.is_empty() {
                    target.insert(key, Value::Object(fresh));
                }
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Case-insensitive header lookup.
pub(crate) fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// The `index`-th part of `text` split by `sep`.
pub fn safe_split_get<'a>(text: &'a str, sep: &str, index: usize) -> Option<&'a str> {
    text.split(sep).nth(index)
}

/// Top-level `key` of a JSON object body.
pub fn key_from_json(body: &[u8], key: &str) -> Option<Value> {
    match serde_json::from_slice::<Value>(body).ok()? {
        Value::Object(mut map) => map.remove(key).filter(|v| !v.is_null()),
        _ => None,
    }
}

/// `key` of a form-encoded body such as `Action=Publish&TopicArn=arn...`.
pub fn key_from_query(body: &[u8], key: &str) -> Option<String> {
    url::form_urlencoded::parse(body)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Text at a `/`-separated element path of an XML body.
///
/// A numeric segment picks the n-th occurrence of the element before it, so
/// `a/b/1/c` reads `c` inside the second `b`.
pub fn key_from_xml(body: &[u8], path: &str) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let segments: Vec<&str> = path.split('/').collect();

    let mut current = text;
    for (i, segment) in segments.iter().enumerate() {
        if segment.parse::<usize>().is_ok() {
            continue;
        }
        let index = segments
            .get(i + 1)
            .and_then(|next| next.parse::<usize>().ok())
            .unwrap_or(0);
        let name = regex::escape(segment);
        let element = RegexBuilder::new(&format!(r"<{name}(?:\s[^>]*)?>(.*?)</{name}>"))
            .dot_matches_new_line(true)
            .build()
            .ok()?;
        let captures = element.captures_iter(current).nth(index)?;
        current = captures.get(1)?.as_str();
    }
    Some(current.trim().to_string())
}
