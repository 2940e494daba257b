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

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use viewtree_lib::access::Check;
use viewtree_lib::access::Policy;
use viewtree_lib::descriptor::AssociationDescriptor;
use viewtree_lib::descriptor::AttributeDescriptor;
use viewtree_lib::descriptor::ViewDescriptor;
use viewtree_lib::engine::Engine;
use viewtree_lib::engine::SerializeOptions;
use viewtree_lib::error::Error;
use viewtree_lib::memory_store::MemoryStore;
use viewtree_lib::record::RecordId;
use viewtree_lib::reference::ViewName;
use viewtree_lib::registry::ViewRegistry;
use viewtree_lib::value::Text;

/// `Doc` documents with `Note` children. Visibility requires membership,
/// editability is lost on a read-only share, and the title can only ever
/// be set, not changed.
fn doc_env() -> (Engine, Arc<MemoryStore>) {
    let mut registry = ViewRegistry::new();
    registry
        .register(
            ViewDescriptor::builder("Note")
                .record_type("notes")
                .attribute(AttributeDescriptor::new("body", Arc::new(Text)))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            ViewDescriptor::builder("Doc")
                .record_type("docs")
                .root()
                .attribute(AttributeDescriptor::new("title", Arc::new(Text)))
                .association(
                    AssociationDescriptor::many("notes", "Note").inverse("doc"),
                )
                .policy(
                    Policy::builder()
                        .visible(
                            Check::permit("members see their documents")
                                .when(|ctx| ctx.params["member"] == json!(true)),
                        )
                        .editable(
                            Check::deny("the share is read-only")
                                .when(|ctx| ctx.params["share"] == json!("ro")),
                        )
                        .valid_edit(Check::deny("the title is write-once").when(|ctx| {
                            ctx.change
                                .is_some_and(|change| change.changed_attributes.contains("title"))
                                && ctx.view.is_persisted()
                        }))
                        .root_children_editable(
                            Check::deny("sealed documents are frozen")
                                .when(|ctx| ctx.params["sealed"] == json!(true)),
                        )
                        .build(),
                )
                .build()
                .unwrap(),
        )
        .unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(Arc::new(registry), store.clone());
    (engine, store)
}

fn member_params() -> Value {
    json!({"member": true})
}

fn write(engine: &Engine, payload: Value, params: &Value) -> Result<(), Error> {
    engine
        .deserialize(&payload, &Map::new(), params, &SerializeOptions::default())
        .map(|_| ())
}

fn seed_doc(store: &MemoryStore, id: i64, title: &str) {
    store.seed(
        "docs",
        RecordId::Int(id),
        testutils::columns(&[("title", json!(title))]),
    );
}

#[test]
fn test_invisible_root_rejects_the_write() {
    let (engine, store) = doc_env();
    seed_doc(&store, 1, "t");
    let err = write(
        &engine,
        json!({"_type": "Doc", "id": 1, "title": "other"}),
        &json!({"member": false}),
    )
    .unwrap_err();
    let envelope = err.envelope();
    assert_eq!(envelope.code, "Permissions.Visibility");
    assert_eq!(envelope.status, 403);
    // Nothing was written.
    assert_eq!(
        store.row("docs", &RecordId::Int(1)).unwrap().get("title"),
        Some(&json!("t"))
    );
}

#[test]
fn test_invisible_root_rejects_the_read() {
    let (engine, store) = doc_env();
    seed_doc(&store, 1, "t");
    let err = engine
        .serialize(
            &[(ViewName::new("Doc"), RecordId::Int(1))],
            &json!({"member": false}),
            &SerializeOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.envelope().code, "Serialization.Permissions");
}

#[test]
fn test_editability_is_checked_only_on_actual_change() {
    let (engine, store) = doc_env();
    seed_doc(&store, 1, "t");
    let params = json!({"member": true, "share": "ro"});

    // A no-op write passes: the record never becomes dirty.
    write(&engine, json!({"_type": "Doc", "id": 1, "title": "t"}), &params).unwrap();

    // A real change trips the editability denial.
    let err = write(
        &engine,
        json!({"_type": "Doc", "id": 1, "title": "other"}),
        &params,
    )
    .unwrap_err();
    assert_eq!(err.envelope().code, "Permissions.Editability");
}

#[test]
fn test_valid_edit_sees_the_change_summary() {
    let (engine, store) = doc_env();
    seed_doc(&store, 1, "original");

    // Creating with a title is fine; changing it later is not.
    write(
        &engine,
        json!({"_type": "Doc", "title": "fresh"}),
        &member_params(),
    )
    .unwrap();
    let err = write(
        &engine,
        json!({"_type": "Doc", "id": 1, "title": "changed"}),
        &member_params(),
    )
    .unwrap_err();
    assert_eq!(err.envelope().code, "Permissions.Editability");
    assert_eq!(
        store.row("docs", &RecordId::Int(1)).unwrap().get("title"),
        Some(&json!("original"))
    );
}

#[test]
fn test_root_scoped_checks_cascade_to_children() {
    let (engine, store) = doc_env();
    seed_doc(&store, 1, "t");

    let sealed = json!({"member": true, "sealed": true});
    let err = write(
        &engine,
        json!({"_type": "Doc", "id": 1, "notes": [{"_type": "Note", "body": "no entry"}]}),
        &sealed,
    )
    .unwrap_err();
    assert_eq!(err.envelope().code, "Permissions.Editability");
    assert_eq!(store.ids("notes"), vec![]);

    // The same write passes on an unsealed document.
    write(
        &engine,
        json!({"_type": "Doc", "id": 1, "notes": [{"_type": "Note", "body": "fine"}]}),
        &member_params(),
    )
    .unwrap();
    assert_eq!(store.ids("notes").len(), 1);
}
