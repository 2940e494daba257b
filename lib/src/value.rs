// Copyright 2024 The Viewtree Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Attribute value codecs.
//!
//! A codec normalizes an incoming wire value into the representation stored
//! on the record, and renders the stored representation back onto the wire.
//! Codecs are declared per attribute on the view descriptor; an attribute
//! flagged as an array applies its codec elementwise.

use std::fmt::Debug;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected {expected}, got {actual}")]
pub struct CodecError {
    pub expected: String,
    pub actual: String,
}

impl CodecError {
    fn mismatch(expected: &str, value: &Value) -> Self {
        CodecError {
            expected: expected.to_owned(),
            actual: type_name(value).to_owned(),
        }
    }
}

/// Names the JSON type of a value the way error messages spell it.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub trait ValueCodec: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Normalizes a wire value into its stored representation. Null always
    /// passes through; nullability is the store's concern.
    fn decode(&self, value: &Value) -> Result<Value, CodecError>;

    /// Renders a stored value back onto the wire.
    fn encode(&self, value: &Value) -> Value {
        value.clone()
    }
}

/// Accepts any JSON value unchanged.
#[derive(Debug)]
pub struct Passthrough;

impl ValueCodec for Passthrough {
    fn name(&self) -> &'static str {
        "any"
    }

    fn decode(&self, value: &Value) -> Result<Value, CodecError> {
        Ok(value.clone())
    }
}

#[derive(Debug)]
pub struct Text;

impl ValueCodec for Text {
    fn name(&self) -> &'static str {
        "string"
    }

    fn decode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null | Value::String(_) => Ok(value.clone()),
            _ => Err(CodecError::mismatch("string", value)),
        }
    }
}

#[derive(Debug)]
pub struct Integer;

impl ValueCodec for Integer {
    fn name(&self) -> &'static str {
        "integer"
    }

    fn decode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Number(n) if n.as_i64().is_some() => Ok(value.clone()),
            _ => Err(CodecError::mismatch("integer", value)),
        }
    }
}

#[derive(Debug)]
pub struct Float;

impl ValueCodec for Float {
    fn name(&self) -> &'static str {
        "float"
    }

    fn decode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Number(_) => Ok(value.clone()),
            _ => Err(CodecError::mismatch("float", value)),
        }
    }
}

#[derive(Debug)]
pub struct Boolean;

impl ValueCodec for Boolean {
    fn name(&self) -> &'static str {
        "boolean"
    }

    fn decode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null | Value::Bool(_) => Ok(value.clone()),
            _ => Err(CodecError::mismatch("boolean", value)),
        }
    }
}

/// RFC 3339 timestamps, stored in canonical UTC form.
#[derive(Debug)]
pub struct Timestamp;

impl ValueCodec for Timestamp {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn decode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(parsed) => Ok(Value::from(
                    parsed
                        .with_timezone(&Utc)
                        .to_rfc3339_opts(SecondsFormat::Micros, true),
                )),
                Err(_) => Err(CodecError {
                    expected: "RFC 3339 timestamp".to_owned(),
                    actual: format!("{s:?}"),
                }),
            },
            _ => Err(CodecError::mismatch("RFC 3339 timestamp", value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_scalar_codecs_accept_matching_types() {
        assert_eq!(Text.decode(&json!("a")), Ok(json!("a")));
        assert_eq!(Integer.decode(&json!(3)), Ok(json!(3)));
        assert_eq!(Float.decode(&json!(1.5)), Ok(json!(1.5)));
        assert_eq!(Boolean.decode(&json!(true)), Ok(json!(true)));
        assert_eq!(Passthrough.decode(&json!({"k": 1})), Ok(json!({"k": 1})));
    }

    #[test]
    fn test_scalar_codecs_pass_null_through() {
        assert_eq!(Text.decode(&Value::Null), Ok(Value::Null));
        assert_eq!(Integer.decode(&Value::Null), Ok(Value::Null));
        assert_eq!(Timestamp.decode(&Value::Null), Ok(Value::Null));
    }

    #[test]
    fn test_scalar_codecs_reject_mismatches() {
        assert_eq!(
            Text.decode(&json!(1)),
            Err(CodecError {
                expected: "string".to_owned(),
                actual: "number".to_owned(),
            })
        );
        assert!(Integer.decode(&json!(1.5)).is_err());
        assert!(Boolean.decode(&json!("true")).is_err());
    }

    #[test]
    fn test_timestamp_normalizes_to_utc() {
        let decoded = Timestamp.decode(&json!("2024-03-01T12:30:00+02:00")).unwrap();
        assert_eq!(decoded, json!("2024-03-01T10:30:00.000000Z"));
        assert!(Timestamp.decode(&json!("yesterday")).is_err());
    }
}
