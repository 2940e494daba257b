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

//! Row-level data as seen through the storage interface.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Primary key of a persisted record. Either an integer or a string,
/// depending on what the underlying table declares.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    /// Parses a wire value into a record id. Only integers and strings are
    /// legal identities.
    pub fn from_value(value: &Value) -> Option<RecordId> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordId::Int),
            Value::String(s) => Some(RecordId::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Int(n) => Value::from(*n),
            RecordId::Text(s) => Value::from(s.clone()),
        }
    }
}

impl Debug for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => f.debug_tuple("RecordId").field(n).finish(),
            RecordId::Text(s) => f.debug_tuple("RecordId").field(s).finish(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{n}"),
            RecordId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        RecordId::Int(n)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::Text(s.to_owned())
    }
}

/// One row of the underlying store: table name, identity, and column values
/// in column declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordData {
    pub table: String,
    pub id: Option<RecordId>,
    pub values: IndexMap<String, Value>,
}

impl RecordData {
    pub fn new(table: impl Into<String>) -> Self {
        RecordData {
            table: table.into(),
            id: None,
            values: IndexMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    /// Reads an integer column, treating a missing or null column as absent.
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.values.get(column).and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_record_id_from_value() {
        assert_eq!(RecordId::from_value(&json!(7)), Some(RecordId::Int(7)));
        assert_eq!(
            RecordId::from_value(&json!("ab")),
            Some(RecordId::Text("ab".to_owned()))
        );
        assert_eq!(RecordId::from_value(&json!(1.5)), None);
        assert_eq!(RecordId::from_value(&json!(null)), None);
        assert_eq!(RecordId::from_value(&json!([1])), None);
    }

    #[test]
    fn test_record_id_round_trips_through_value() {
        for id in [RecordId::Int(42), RecordId::Text("k".to_owned())] {
            assert_eq!(RecordId::from_value(&id.to_value()), Some(id));
        }
    }
}
