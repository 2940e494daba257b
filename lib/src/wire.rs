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

//! The wire vocabulary.
//!
//! Every view object reserves a handful of keys; everything else is an
//! attribute or association of the declared view type. Functional updates
//! ride inline in a collection's position as a `_type: "_update"` wrapper.

use serde_json::Map;
use serde_json::Value;

/// View name of the object. Required on roots and polymorphic children.
pub const TYPE: &str = "_type";
/// Schema version the object was authored at; current version if absent.
pub const VERSION: &str = "_version";
/// Record identity; absent for new records.
pub const ID: &str = "id";
/// Forces new-record semantics even when an `id` is supplied.
pub const NEW: &str = "_new";
/// Reference into the side-table; mutually exclusive with all other keys.
pub const REF: &str = "_ref";

/// `_type` of a functional update wrapper.
pub const FUNCTIONAL_UPDATE: &str = "_update";
pub const ACTIONS: &str = "actions";
pub const ACTION_APPEND: &str = "append";
pub const ACTION_REMOVE: &str = "remove";
pub const ACTION_UPDATE: &str = "update";
pub const VALUES: &str = "values";
pub const BEFORE: &str = "before";
pub const AFTER: &str = "after";

pub fn is_reserved_key(key: &str) -> bool {
    matches!(key, TYPE | VERSION | ID | NEW | REF)
}

/// Type names led by an underscore are wire machinery, never view names.
pub fn is_reserved_type(name: &str) -> bool {
    name.starts_with('_')
}

/// The key of a pure `{"_ref": key}` object.
pub fn ref_key(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get(REF)?.as_str()
}

pub fn is_ref(value: &Value) -> bool {
    ref_key(value).is_some()
}

pub fn type_of(node: &Map<String, Value>) -> Option<&str> {
    node.get(TYPE)?.as_str()
}

pub fn is_functional_update(value: &Value) -> bool {
    value
        .as_object()
        .and_then(type_of)
        .is_some_and(|t| t == FUNCTIONAL_UPDATE)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_ref_key_is_exclusive() {
        assert_eq!(ref_key(&json!({"_ref": "k"})), Some("k"));
        // A reference carrying any other key is not a pure reference.
        assert_eq!(ref_key(&json!({"_ref": "k", "id": 1})), None);
        assert_eq!(ref_key(&json!({"_ref": 3})), None);
        assert_eq!(ref_key(&json!("k")), None);
    }

    #[test]
    fn test_functional_update_detection() {
        assert!(is_functional_update(&json!({"_type": "_update", "actions": []})));
        assert!(!is_functional_update(&json!({"_type": "Child"})));
        assert!(!is_functional_update(&json!([])));
    }

    #[test]
    fn test_reserved_vocabulary() {
        for key in [TYPE, VERSION, ID, NEW, REF] {
            assert!(is_reserved_key(key));
        }
        assert!(!is_reserved_key("name"));
        assert!(is_reserved_type(FUNCTIONAL_UPDATE));
        assert!(!is_reserved_type("Parent"));
    }
}
