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

//! Test environment for the viewtree-lib test suite.
//!
//! Builds the canonical schema the integration tests talk about:
//!
//! - `Parent` (root): `name`, read-only `created_at`, write-once `code`,
//!   optimistic `lock_version`; a single remote-pointer `child`, an
//!   ordered `children` collection of `Item`s, a local-pointer `label`,
//!   and a by-reference `tags` collection through the `Tagging` join.
//! - `Child`, `Item` (list-ordered), `Label`, `Tag`, `Tagging`.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::json;
use serde_json::Value;
use viewtree_lib::descriptor::AssociationDescriptor;
use viewtree_lib::descriptor::AttributeDescriptor;
use viewtree_lib::descriptor::DependentPolicy;
use viewtree_lib::descriptor::ViewDescriptor;
use viewtree_lib::engine::Engine;
use viewtree_lib::memory_store::MemoryStore;
use viewtree_lib::record::RecordId;
use viewtree_lib::registry::ViewRegistry;
use viewtree_lib::value::Integer;
use viewtree_lib::value::Text;

pub struct TestEnv {
    pub registry: Arc<ViewRegistry>,
    pub store: Arc<MemoryStore>,
    pub engine: Engine,
}

/// The canonical registry. Tests that need extra view types build their
/// own registry or extend a fresh one before wrapping it in an engine.
pub fn test_registry() -> ViewRegistry {
    let mut registry = ViewRegistry::new();
    registry
        .register(
            ViewDescriptor::builder("Child")
                .record_type("children")
                .attribute(AttributeDescriptor::new("name", Arc::new(Text)))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            ViewDescriptor::builder("Item")
                .record_type("items")
                .attribute(AttributeDescriptor::new("name", Arc::new(Text)))
                .list_attribute("position")
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            ViewDescriptor::builder("Label")
                .record_type("labels")
                .attribute(AttributeDescriptor::new("text", Arc::new(Text)))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            ViewDescriptor::builder("Tag")
                .record_type("tags")
                .attribute(AttributeDescriptor::new("name", Arc::new(Text)))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            ViewDescriptor::builder("Tagging")
                .record_type("taggings")
                .list_attribute("position")
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            ViewDescriptor::builder("Parent")
                .record_type("parents")
                .root()
                .attribute(AttributeDescriptor::new("name", Arc::new(Text)))
                .attribute(AttributeDescriptor::new("created_at", Arc::new(Text)).read_only())
                .attribute(AttributeDescriptor::new("code", Arc::new(Text)).write_once())
                .attribute(AttributeDescriptor::new("lock_version", Arc::new(Integer)))
                .lock_attribute("lock_version")
                .association(
                    AssociationDescriptor::one("child", "Child")
                        .pointer(viewtree_lib::descriptor::PointerLocation::Remote)
                        .inverse("parent")
                        .dependent(DependentPolicy::Destroy),
                )
                .association(
                    AssociationDescriptor::many("children", "Item")
                        .inverse("parent")
                        .dependent(DependentPolicy::Destroy),
                )
                .association(
                    AssociationDescriptor::one("label", "Label").dependent(DependentPolicy::Delete),
                )
                .association(
                    AssociationDescriptor::many("tags", "Tag")
                        .through("Tagging", "parent_id", "tag_id")
                        .by_reference(),
                )
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
}

/// A fresh engine over an empty in-memory store with the canonical schema
/// and its foreign keys.
pub fn test_env() -> TestEnv {
    let registry = Arc::new(test_registry());
    let store = Arc::new(MemoryStore::new());
    store.add_foreign_key("children", "parent_id", "parents");
    store.add_foreign_key("items", "parent_id", "parents");
    store.add_foreign_key("parents", "label_id", "labels");
    store.add_foreign_key("taggings", "parent_id", "parents");
    store.add_foreign_key("taggings", "tag_id", "tags");
    let engine = Engine::new(Arc::clone(&registry), store.clone());
    TestEnv {
        registry,
        store,
        engine,
    }
}

pub fn columns(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
    pairs
        .iter()
        .map(|(column, value)| ((*column).to_owned(), value.clone()))
        .collect()
}

pub fn seed_parent(store: &MemoryStore, id: i64, name: &str) {
    store.seed(
        "parents",
        RecordId::Int(id),
        columns(&[("name", json!(name)), ("lock_version", json!(0))]),
    );
}

pub fn seed_child(store: &MemoryStore, id: i64, parent: Option<i64>, name: &str) {
    store.seed(
        "children",
        RecordId::Int(id),
        columns(&[
            ("name", json!(name)),
            ("parent_id", parent.map_or(Value::Null, Value::from)),
        ]),
    );
}

pub fn seed_item(store: &MemoryStore, id: i64, parent: i64, name: &str, position: f64) {
    store.seed(
        "items",
        RecordId::Int(id),
        columns(&[
            ("name", json!(name)),
            ("parent_id", json!(parent)),
            ("position", json!(position)),
        ]),
    );
}

pub fn seed_tag(store: &MemoryStore, id: i64, name: &str) {
    store.seed("tags", RecordId::Int(id), columns(&[("name", json!(name))]));
}

pub fn seed_tagging(store: &MemoryStore, id: i64, parent: i64, tag: i64, position: f64) {
    store.seed(
        "taggings",
        RecordId::Int(id),
        columns(&[
            ("parent_id", json!(parent)),
            ("tag_id", json!(tag)),
            ("position", json!(position)),
        ]),
    );
}

/// Items of a parent in list order, as `(id, name, position)`.
pub fn items_in_order(store: &MemoryStore, parent: i64) -> Vec<(i64, String, f64)> {
    let mut rows: Vec<(i64, String, f64)> = store
        .ids("items")
        .into_iter()
        .filter_map(|id| {
            let row = store.row("items", &id)?;
            if row.get("parent_id") != Some(&json!(parent)) {
                return None;
            }
            let RecordId::Int(id) = id else { return None };
            Some((
                id,
                row.get("name").and_then(Value::as_str).unwrap_or("").to_owned(),
                row.get("position").and_then(Value::as_f64).unwrap_or(f64::MAX),
            ))
        })
        .collect();
    rows.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap());
    rows
}

/// Guards the runner against test files that were added but never wired
/// into `runner.rs`.
pub fn assert_no_forgotten_test_files(test_dir: &Path) {
    let runner = std::fs::read_to_string(test_dir.join("runner.rs")).unwrap();
    for entry in std::fs::read_dir(test_dir).unwrap() {
        let name = entry.unwrap().file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".rs").filter(|s| s.starts_with("test_")) {
            assert!(
                runner.contains(&format!("mod {stem};")),
                "test file {name} is not declared in runner.rs"
            );
        }
    }
}
