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
use testutils::items_in_order;
use testutils::seed_item;
use testutils::seed_parent;
use testutils::test_env;
use testutils::TestEnv;
use viewtree_lib::engine::SerializeOptions;
use viewtree_lib::error::Error;
use viewtree_lib::record::RecordId;

fn write(
    env: &TestEnv,
    payload: Value,
    references: Value,
) -> Result<viewtree_lib::engine::DeserializeResponse, Error> {
    let references: Map<String, Value> = references.as_object().unwrap().clone();
    env.engine.deserialize(
        &payload,
        &references,
        &json!({}),
        &SerializeOptions::default(),
    )
}

fn env_with_items() -> TestEnv {
    let env = test_env();
    seed_parent(&env.store, 1, "p");
    seed_item(&env.store, 11, 1, "c1", 1.0);
    seed_item(&env.store, 12, 1, "c2", 2.0);
    seed_item(&env.store, 13, 1, "c3", 3.0);
    env
}

fn assert_strictly_increasing(items: &[(i64, String, f64)]) {
    for pair in items.windows(2) {
        assert!(
            pair[0].2 < pair[1].2,
            "positions not strictly increasing: {items:?}"
        );
    }
}

#[test]
fn test_append_with_before_anchor() {
    let env = env_with_items();
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "append", "values": [{"_ref": "n"}], "before": {"_ref": "c2-ref"}},
        ]}}),
        json!({
            "n": {"_type": "Item", "name": "new"},
            "c2-ref": {"_type": "Item", "id": 12},
        }),
    )
    .unwrap();

    let items = items_in_order(&env.store, 1);
    let names: Vec<&str> = items.iter().map(|(_, name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["c1", "new", "c2", "c3"]);
    assert_strictly_increasing(&items);
    // Only the new element received a fresh position.
    assert_eq!(items[0].2, 1.0);
    assert_eq!(items[2].2, 2.0);
    assert_eq!(items[3].2, 3.0);
}

#[test]
fn test_append_with_after_anchor() {
    let env = env_with_items();
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "append", "values": [{"_type": "Item", "name": "new"}],
             "after": {"_ref": "c2-ref"}},
        ]}}),
        json!({"c2-ref": {"_type": "Item", "id": 12}}),
    )
    .unwrap();
    let names: Vec<String> = items_in_order(&env.store, 1)
        .into_iter()
        .map(|(_, name, _)| name)
        .collect();
    assert_eq!(names, vec!["c1", "c2", "new", "c3"]);
}

#[test]
fn test_append_without_anchor_goes_last() {
    let env = env_with_items();
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "append", "values": [{"_type": "Item", "name": "new"}]},
        ]}}),
        json!({}),
    )
    .unwrap();
    let items = items_in_order(&env.store, 1);
    assert_eq!(items.last().unwrap().1, "new");
    assert_strictly_increasing(&items);
}

#[test]
fn test_append_moves_existing_element() {
    let env = env_with_items();
    // Moving c3 before c1 reorders without creating or destroying.
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "append", "values": [{"_ref": "c3-ref"}], "before": {"_ref": "c1-ref"}},
        ]}}),
        json!({
            "c3-ref": {"_type": "Item", "id": 13},
            "c1-ref": {"_type": "Item", "id": 11},
        }),
    )
    .unwrap();
    let items = items_in_order(&env.store, 1);
    let ids: Vec<i64> = items.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids, vec![13, 11, 12]);
    assert_strictly_increasing(&items);
}

#[test]
fn test_stale_functional_update() {
    let env = env_with_items();
    let err = write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "update", "values": [{"_type": "Item", "id": 999, "name": "x"}]},
        ]}}),
        json!({}),
    )
    .unwrap_err();
    let envelope = err.envelope();
    assert_eq!(envelope.code, "NotFound");
    assert_eq!(envelope.status, 400);
    assert_eq!(envelope.meta["viewmodel"], json!("Item"));
    assert_eq!(envelope.meta["id"], json!(999));
}

#[test]
fn test_update_edits_element_in_place() {
    let env = env_with_items();
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "update", "values": [{"_type": "Item", "id": 12, "name": "renamed"}]},
        ]}}),
        json!({}),
    )
    .unwrap();
    let row = env.store.row("items", &RecordId::Int(12)).unwrap();
    assert_eq!(row.get("name"), Some(&json!("renamed")));
    // Order untouched.
    let ids: Vec<i64> = items_in_order(&env.store, 1)
        .into_iter()
        .map(|(id, _, _)| id)
        .collect();
    assert_eq!(ids, vec![11, 12, 13]);
}

#[test]
fn test_remove_destroys_under_dependent_destroy() {
    let env = env_with_items();
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "remove", "values": [{"_ref": "c2-ref"}]},
        ]}}),
        json!({"c2-ref": {"_type": "Item", "id": 12}}),
    )
    .unwrap();
    assert!(env.store.row("items", &RecordId::Int(12)).is_none());
    let ids: Vec<i64> = items_in_order(&env.store, 1)
        .into_iter()
        .map(|(id, _, _)| id)
        .collect();
    assert_eq!(ids, vec![11, 13]);
}

#[test]
fn test_remove_of_absent_element_is_not_found() {
    let env = env_with_items();
    let err = write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "remove", "values": [{"_ref": "x"}]},
        ]}}),
        json!({"x": {"_type": "Item", "id": 999}}),
    )
    .unwrap_err();
    assert_eq!(err.envelope().code, "NotFound");
}

#[test]
fn test_missing_anchor_is_not_found() {
    let env = env_with_items();
    let err = write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "append", "values": [{"_type": "Item", "name": "new"}],
             "before": {"_ref": "gone"}},
        ]}}),
        json!({"gone": {"_type": "Item", "id": 999}}),
    )
    .unwrap_err();
    assert_eq!(err.envelope().code, "NotFound");
}

#[test]
fn test_reference_may_appear_only_once_across_actions() {
    let env = env_with_items();
    let err = write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": {"_type": "_update", "actions": [
            {"_type": "update", "values": [{"_type": "Item", "id": 12, "name": "a"}]},
            {"_type": "remove", "values": [{"_ref": "c2-ref"}]},
        ]}}),
        json!({"c2-ref": {"_type": "Item", "id": 12}}),
    )
    .unwrap_err();
    assert_eq!(err.envelope().code, "DuplicateReference");
}

#[test]
fn test_replace_collection_reorders_and_releases() {
    let env = env_with_items();
    write(
        &env,
        json!({"_type": "Parent", "id": 1, "children": [
            {"_type": "Item", "id": 13},
            {"_type": "Item", "id": 11},
        ]}),
        json!({}),
    )
    .unwrap();
    let items = items_in_order(&env.store, 1);
    let ids: Vec<i64> = items.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids, vec![13, 11]);
    assert_strictly_increasing(&items);
    // The dropped element fell to the dependent-destroy policy.
    assert!(env.store.row("items", &RecordId::Int(12)).is_none());
}
