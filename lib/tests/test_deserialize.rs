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

use pretty_assertions::assert_eq;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use testutils::seed_child;
use testutils::seed_parent;
use testutils::test_env;
use viewtree_lib::engine::DeserializeResponse;
use viewtree_lib::engine::SerializeOptions;
use viewtree_lib::error::Error;
use viewtree_lib::record::RecordId;

fn write(env: &testutils::TestEnv, payload: Value) -> Result<DeserializeResponse, Error> {
    write_with_refs(env, payload, json!({}))
}

fn write_with_refs(
    env: &testutils::TestEnv,
    payload: Value,
    references: Value,
) -> Result<DeserializeResponse, Error> {
    let references: Map<String, Value> = references.as_object().unwrap().clone();
    env.engine.deserialize(
        &payload,
        &references,
        &json!({}),
        &SerializeOptions::default(),
    )
}

#[test]
fn test_create_with_owned_child() {
    let env = test_env();
    let response = write(
        &env,
        json!({"_type": "Parent", "name": "p", "child": {"_type": "Child", "name": "c"}}),
    )
    .unwrap();

    let data = &response.payload.data;
    assert_eq!(data["_type"], json!("Parent"));
    assert_eq!(data["_version"], json!(1));
    assert_eq!(data["id"], json!(1));
    assert_eq!(data["name"], json!("p"));
    assert_eq!(data["child"]["_type"], json!("Child"));
    assert_eq!(data["child"]["id"], json!(1));
    assert_eq!(data["child"]["name"], json!("c"));

    let parent = env.store.row("parents", &RecordId::Int(1)).unwrap();
    assert_eq!(parent.get("name"), Some(&json!("p")));
    let child = env.store.row("children", &RecordId::Int(1)).unwrap();
    assert_eq!(child.get("parent_id"), Some(&json!(1)));
}

#[test]
fn test_reparent_by_move() {
    let env = test_env();
    seed_parent(&env.store, 1, "a");
    seed_parent(&env.store, 2, "b");
    seed_child(&env.store, 7, Some(1), "X");

    let response = write(
        &env,
        json!([
            {"_type": "Parent", "id": 1, "child": null},
            {"_type": "Parent", "id": 2, "child": {"_type": "Child", "id": 7, "name": "X"}},
        ]),
    )
    .unwrap();

    // Child 7 moved to B and was not destroyed.
    let child = env.store.row("children", &RecordId::Int(7)).unwrap();
    assert_eq!(child.get("parent_id"), Some(&json!(2)));
    assert_eq!(child.get("name"), Some(&json!("X")));

    let data = response.payload.data.as_array().unwrap();
    assert_eq!(data[0]["child"], Value::Null);
    assert_eq!(data[1]["child"]["id"], json!(7));
}

#[test]
fn test_removing_owned_child_destroys_it() {
    let env = test_env();
    seed_parent(&env.store, 1, "a");
    seed_child(&env.store, 7, Some(1), "X");

    write(&env, json!({"_type": "Parent", "id": 1, "child": null})).unwrap();

    assert!(env.store.row("children", &RecordId::Int(7)).is_none());
}

#[test]
fn test_release_then_claim_within_one_request_never_destroys() {
    let env = test_env();
    seed_parent(&env.store, 1, "a");
    seed_parent(&env.store, 2, "b");
    seed_child(&env.store, 7, Some(1), "X");

    // The releasing parent comes first, the claiming parent second; the
    // dependent-destroy of the release must be cancelled by the claim.
    write(
        &env,
        json!([
            {"_type": "Parent", "id": 1, "child": null},
            {"_type": "Parent", "id": 2, "child": {"_type": "Child", "id": 7}},
        ]),
    )
    .unwrap();
    assert!(env.store.row("children", &RecordId::Int(7)).is_some());
}

#[test]
fn test_claim_before_release_in_root_order() {
    let env = test_env();
    seed_parent(&env.store, 1, "a");
    seed_parent(&env.store, 2, "b");
    seed_child(&env.store, 7, Some(1), "X");

    // The claiming parent is planned before the releasing one.
    write(
        &env,
        json!([
            {"_type": "Parent", "id": 2, "child": {"_type": "Child", "id": 7}},
            {"_type": "Parent", "id": 1, "child": null},
        ]),
    )
    .unwrap();
    let child = env.store.row("children", &RecordId::Int(7)).unwrap();
    assert_eq!(child.get("parent_id"), Some(&json!(2)));
}

#[test]
fn test_optimistic_lock_conflict_rolls_back() {
    let env = test_env();
    env.store.seed(
        "parents",
        RecordId::Int(1),
        testutils::columns(&[("name", json!("a")), ("lock_version", json!(3))]),
    );

    let err = write(
        &env,
        json!({"_type": "Parent", "id": 1, "name": "changed", "lock_version": 2}),
    )
    .unwrap_err();
    let envelope = err.envelope();
    assert_eq!(envelope.code, "LockFailure");
    assert_eq!(envelope.status, 409);

    // Full rollback: nothing moved.
    let parent = env.store.row("parents", &RecordId::Int(1)).unwrap();
    assert_eq!(parent.get("name"), Some(&json!("a")));
    assert_eq!(parent.get("lock_version"), Some(&json!(3)));
}

#[test]
fn test_lock_succeeds_with_current_version() {
    let env = test_env();
    env.store.seed(
        "parents",
        RecordId::Int(1),
        testutils::columns(&[("name", json!("a")), ("lock_version", json!(3))]),
    );
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "name": "changed", "lock_version": 3}),
    )
    .unwrap();
    let parent = env.store.row("parents", &RecordId::Int(1)).unwrap();
    assert_eq!(parent.get("name"), Some(&json!("changed")));
    assert_eq!(parent.get("lock_version"), Some(&json!(4)));
}

#[test]
fn test_read_only_attribute_rejected_on_existing_record() {
    let env = test_env();
    env.store.seed(
        "parents",
        RecordId::Int(1),
        testutils::columns(&[("name", json!("a")), ("created_at", json!("2020-01-01"))]),
    );

    let err = write(
        &env,
        json!({"_type": "Parent", "id": 1, "created_at": "2024-12-31"}),
    )
    .unwrap_err();
    let envelope = err.envelope();
    assert_eq!(envelope.code, "ReadOnlyAttribute");
    assert_eq!(envelope.meta["attribute"], json!("created_at"));

    let parent = env.store.row("parents", &RecordId::Int(1)).unwrap();
    assert_eq!(parent.get("created_at"), Some(&json!("2020-01-01")));
}

#[test]
fn test_read_only_attribute_tolerated_when_equal() {
    let env = test_env();
    env.store.seed(
        "parents",
        RecordId::Int(1),
        testutils::columns(&[("name", json!("a")), ("created_at", json!("2020-01-01"))]),
    );
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "name": "b", "created_at": "2020-01-01"}),
    )
    .unwrap();
    let parent = env.store.row("parents", &RecordId::Int(1)).unwrap();
    assert_eq!(parent.get("name"), Some(&json!("b")));
}

#[test]
fn test_write_once_attribute() {
    let env = test_env();
    let response = write(&env, json!({"_type": "Parent", "name": "a", "code": "k-1"})).unwrap();
    let id = response.payload.data["id"].as_i64().unwrap();

    let err = write(&env, json!({"_type": "Parent", "id": id, "code": "k-2"})).unwrap_err();
    assert_eq!(err.envelope().code, "ReadOnlyAttribute");
}

#[test]
fn test_new_with_taken_identity_fails() {
    let env = test_env();
    seed_parent(&env.store, 1, "a");
    let err = write(&env, json!({"_type": "Parent", "id": 1, "_new": true})).unwrap_err();
    assert_eq!(err.envelope().code, "DuplicateRoot");
}

#[test]
fn test_new_with_client_chosen_identity() {
    let env = test_env();
    write(&env, json!({"_type": "Parent", "id": 41, "_new": true, "name": "picked"})).unwrap();
    let parent = env.store.row("parents", &RecordId::Int(41)).unwrap();
    assert_eq!(parent.get("name"), Some(&json!("picked")));
}

#[test]
fn test_local_pointer_child_saves_before_owner() {
    let env = test_env();
    let response = write(
        &env,
        json!({"_type": "Parent", "name": "p", "label": {"_type": "Label", "text": "blue"}}),
    )
    .unwrap();

    let parent_id = response.payload.data["id"].as_i64().unwrap();
    let parent = env.store.row("parents", &RecordId::Int(parent_id)).unwrap();
    let label_id = parent.get("label_id").and_then(Value::as_i64).unwrap();
    let label = env.store.row("labels", &RecordId::Int(label_id)).unwrap();
    assert_eq!(label.get("text"), Some(&json!("blue")));
    assert_eq!(response.payload.data["label"]["text"], json!("blue"));
}

#[test]
fn test_replacing_local_pointer_child_deletes_released_label() {
    let env = test_env();
    env.store.seed(
        "labels",
        RecordId::Int(5),
        testutils::columns(&[("text", json!("old"))]),
    );
    env.store.seed(
        "parents",
        RecordId::Int(1),
        testutils::columns(&[("name", json!("a")), ("label_id", json!(5))]),
    );

    write(
        &env,
        json!({"_type": "Parent", "id": 1, "label": {"_type": "Label", "text": "new"}}),
    )
    .unwrap();

    // Dependent-delete removed the replaced label without callbacks.
    assert!(env.store.row("labels", &RecordId::Int(5)).is_none());
    let parent = env.store.row("parents", &RecordId::Int(1)).unwrap();
    let label_id = parent.get("label_id").and_then(Value::as_i64).unwrap();
    assert_ne!(label_id, 5);
}

#[test]
fn test_unknown_root_view_is_reported() {
    let env = test_env();
    let err = write(&env, json!({"_type": "Mystery"})).unwrap_err();
    assert_eq!(err.envelope().code, "UnknownView");
}

#[test]
fn test_change_summaries_cover_written_nodes() {
    let env = test_env();
    seed_parent(&env.store, 1, "a");
    let response = write(&env, json!({"_type": "Parent", "id": 1, "name": "b"})).unwrap();
    let (_, summary) = response
        .changes
        .iter()
        .find(|(reference, _)| reference.id == Some(RecordId::Int(1)))
        .unwrap();
    assert!(summary.changed_attributes.contains("name"));
    assert!(!summary.new);
}
