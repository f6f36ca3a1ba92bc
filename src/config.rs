// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Typed access to JSON configuration trees.
//!
//! Command payloads and data-source configurations arrive as
//! [`serde_json::Value`] trees. The accessors here convert nodes to the
//! expected kind or fail with a [`TypeError`] naming what was expected
//! and what was found, so that shape errors surface with a usable
//! message instead of a panic deep in a handler.

use std::fmt;

pub use serde_json::{Map, Value};

/// The error produced when a configuration node has the wrong kind.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeError {
    pub expected: &'static str,
    pub found: &'static str,
}

impl TypeError {
    fn new(expected: &'static str, found: &Value) -> Self {
        Self {
            expected,
            found: kind_of(found),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

impl std::error::Error for TypeError {}

/// Names the kind of a [`Value`] for error messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}

/// Converts a node to a map.
pub fn map_value(value: &Value) -> Result<&Map<String, Value>, TypeError> {
    value
        .as_object()
        .ok_or_else(|| TypeError::new("a map", value))
}

/// Converts a node to a list.
pub fn list_value(value: &Value) -> Result<&[Value], TypeError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| TypeError::new("a list", value))
}

/// Converts a node to a string.
pub fn str_value(value: &Value) -> Result<&str, TypeError> {
    value
        .as_str()
        .ok_or_else(|| TypeError::new("a string", value))
}

/// Converts a node to an integer.
pub fn int_value(value: &Value) -> Result<i64, TypeError> {
    value
        .as_i64()
        .ok_or_else(|| TypeError::new("an integer", value))
}

/// Converts a node to a boolean.
pub fn bool_value(value: &Value) -> Result<bool, TypeError> {
    value
        .as_bool()
        .ok_or_else(|| TypeError::new("a boolean", value))
}

/// Fetches `key` from a map node. Returns [`None`] if the node is not a
/// map or has no such key.
pub fn get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_object().and_then(|map| map.get(key))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accessors_accept_matching_kinds() {
        let tree = json!({
            "name": "dsrc1",
            "cache-enable": true,
            "generation-id": 42,
            "zones": ["test1.example"],
            "params": {},
        });
        assert_eq!(str_value(get(&tree, "name").unwrap()).unwrap(), "dsrc1");
        assert!(bool_value(get(&tree, "cache-enable").unwrap()).unwrap());
        assert_eq!(int_value(get(&tree, "generation-id").unwrap()).unwrap(), 42);
        assert_eq!(list_value(get(&tree, "zones").unwrap()).unwrap().len(), 1);
        assert!(map_value(get(&tree, "params").unwrap()).unwrap().is_empty());
    }

    #[test]
    fn accessors_report_mismatches() {
        let err = str_value(&json!(1)).unwrap_err();
        assert_eq!(err.expected, "a string");
        assert_eq!(err.found, "a number");
        assert_eq!(err.to_string(), "expected a string, found a number");

        assert!(int_value(&json!(1.5)).is_err()); // not an i64
        assert!(map_value(&json!([])).is_err());
        assert!(bool_value(&Value::Null).is_err());
    }

    #[test]
    fn get_handles_non_maps_and_missing_keys() {
        assert!(get(&json!([1, 2]), "key").is_none());
        assert!(get(&json!({"other": 1}), "key").is_none());
    }
}
