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

//! The serializer.
//!
//! Produces the outgoing view tree. A record reached through a
//! by-reference association is emitted once into the references side-table
//! under an interned opaque key and appears as `{"_ref": key}` at every
//! use site. A separate mark pass drops side-table entries that are no
//! longer reachable from the roots, which matters after migrations have
//! rewritten the tree.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::access::AccessTree;
use crate::dag_walk;
use crate::descriptor::AssociationDescriptor;
use crate::descriptor::Cardinality;
use crate::descriptor::PointerLocation;
use crate::record::RecordId;
use crate::reference::Reference;
use crate::reference::ReferenceKey;
use crate::reference::ViewName;
use crate::registry::RegistryError;
use crate::registry::ViewRegistry;
use crate::store::StoreError;
use crate::store::StoreTransaction;
use crate::viewmodel::AssociationCache;
use crate::viewmodel::ViewModel;
use crate::wire;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("{node} is not visible: {reason}")]
    Permissions { node: Reference, reason: String },
    #[error("{node} is gone")]
    NotFound { node: Reference },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct SerializedPayload {
    /// A single view object, or an array when several roots were asked for.
    pub data: Value,
    pub references: Map<String, Value>,
}

pub struct Serializer<'a, 't> {
    registry: &'a ViewRegistry,
    txn: &'t mut dyn StoreTransaction,
    access: AccessTree<'a>,
    references: IndexMap<ReferenceKey, Value>,
    interned: HashMap<Reference, ReferenceKey>,
    visiting: HashSet<Reference>,
}

impl<'a, 't> Serializer<'a, 't> {
    pub fn new(
        registry: &'a ViewRegistry,
        txn: &'t mut dyn StoreTransaction,
        params: &'a Value,
    ) -> Self {
        Serializer {
            registry,
            txn,
            access: AccessTree::new(params),
            references: IndexMap::new(),
            interned: HashMap::new(),
            visiting: HashSet::new(),
        }
    }

    /// Serializes records loaded from the store (the read path).
    pub fn serialize_records(
        mut self,
        roots: &[(ViewName, RecordId)],
    ) -> Result<SerializedPayload, SerializeError> {
        let mut views = Vec::with_capacity(roots.len());
        for (view, id) in roots {
            let descriptor = self.registry.lookup(view)?.clone();
            let node = Reference::persisted(view.clone(), id.clone());
            let record = self
                .txn
                .find(descriptor.record_type(), id)?
                .ok_or_else(|| SerializeError::NotFound { node })?;
            views.push(ViewModel::from_record(descriptor, record));
        }
        self.serialize_views(&views)
    }

    /// Serializes already-materialized viewmodels (the response of a
    /// write). Association caches left by the executor are preferred over
    /// fresh loads.
    pub fn serialize_views(
        mut self,
        roots: &[ViewModel],
    ) -> Result<SerializedPayload, SerializeError> {
        let mut serialized = Vec::with_capacity(roots.len());
        for root in roots {
            self.access.enter_root(root);
            let result = self.serialize_node(root, Some(&root.reference()));
            self.access.exit_root(&root.reference());
            serialized.push(result?);
        }
        let data = match serialized.len() {
            1 => serialized.into_iter().next().unwrap(),
            _ => Value::Array(serialized),
        };
        let mut references: Map<String, Value> = self
            .references
            .into_iter()
            .map(|(key, value)| (key.as_str().to_owned(), value))
            .collect();
        prune_unreachable(&data, &mut references);
        Ok(SerializedPayload { data, references })
    }

    fn serialize_node(
        &mut self,
        viewmodel: &ViewModel,
        root: Option<&Reference>,
    ) -> Result<Value, SerializeError> {
        let reference = viewmodel.reference();
        self.access
            .check_visible(viewmodel, root)
            .map_err(|err| match err {
                crate::access::AccessError::Visibility { node, reason } => {
                    SerializeError::Permissions { node, reason }
                }
                other => SerializeError::Permissions {
                    node: reference.clone(),
                    reason: other.to_string(),
                },
            })?;

        let descriptor = Arc::clone(viewmodel.descriptor());
        let mut node = Map::new();
        node.insert(
            wire::TYPE.to_owned(),
            Value::from(descriptor.name().as_str()),
        );
        node.insert(
            wire::VERSION.to_owned(),
            Value::from(descriptor.schema_version()),
        );
        if let Some(id) = viewmodel.id() {
            node.insert(wire::ID.to_owned(), id.to_value());
        }
        for attribute in descriptor.attributes() {
            let stored = viewmodel
                .attribute(attribute.column())
                .cloned()
                .unwrap_or(Value::Null);
            let encoded = if attribute.is_array() {
                match stored {
                    Value::Array(items) => Value::Array(
                        items.iter().map(|item| attribute.codec().encode(item)).collect(),
                    ),
                    other => other,
                }
            } else {
                attribute.codec().encode(&stored)
            };
            node.insert(attribute.name().to_owned(), encoded);
        }

        // Cycles among records are legal; a re-entered node serializes as
        // its envelope only.
        if !self.visiting.insert(reference.clone()) {
            return Ok(Value::Object(node));
        }
        for association in descriptor.associations() {
            let serialized = self.serialize_association(viewmodel, association, root)?;
            node.insert(association.name().to_owned(), serialized);
        }
        self.visiting.remove(&reference);

        Ok(Value::Object(node))
    }

    fn serialize_association(
        &mut self,
        owner: &ViewModel,
        association: &AssociationDescriptor,
        root: Option<&Reference>,
    ) -> Result<Value, SerializeError> {
        let children = self.association_children(owner, association)?;
        match association.cardinality() {
            Cardinality::One => match children.into_iter().next() {
                None => Ok(Value::Null),
                Some(child) => self.serialize_child(&child, association, root),
            },
            Cardinality::Many => {
                let mut items = Vec::with_capacity(children.len());
                for child in &children {
                    items.push(self.serialize_child(child, association, root)?);
                }
                Ok(Value::Array(items))
            }
        }
    }

    /// Inline subtree, or an interned `{"_ref": key}` for by-reference
    /// associations.
    fn serialize_child(
        &mut self,
        child: &ViewModel,
        association: &AssociationDescriptor,
        root: Option<&Reference>,
    ) -> Result<Value, SerializeError> {
        if !association.is_by_reference() {
            return self.serialize_node(child, root);
        }
        let reference = child.reference();
        if let Some(key) = self.interned.get(&reference) {
            let mut stub = Map::new();
            stub.insert(wire::REF.to_owned(), Value::from(key.as_str()));
            return Ok(Value::Object(stub));
        }
        let key = self.allocate_key(&reference);
        self.interned.insert(reference, key.clone());
        // Reserve the slot first so nested occurrences reuse the key.
        self.references.insert(key.clone(), Value::Null);
        let serialized = self.serialize_node(child, root)?;
        self.references.insert(key.clone(), serialized);
        let mut stub = Map::new();
        stub.insert(wire::REF.to_owned(), Value::from(key.as_str()));
        Ok(Value::Object(stub))
    }

    /// A stable opaque key for a record reference.
    fn allocate_key(&self, reference: &Reference) -> ReferenceKey {
        let mut hasher = DefaultHasher::new();
        reference.hash(&mut hasher);
        let mut key = ReferenceKey::new(format!("ref-{}", hex::encode(hasher.finish().to_be_bytes())));
        while self.references.contains_key(&key) {
            key = ReferenceKey::new(format!("{}x", key.as_str()));
        }
        key
    }

    /// The current children of one association, preferring the cache the
    /// executor left on the viewmodel.
    fn association_children(
        &mut self,
        owner: &ViewModel,
        association: &AssociationDescriptor,
    ) -> Result<Vec<ViewModel>, SerializeError> {
        if let Some(cache) = owner.association(association.name()) {
            return Ok(match cache {
                AssociationCache::One(child) => {
                    child.iter().map(|boxed| (**boxed).clone()).collect()
                }
                AssociationCache::Many(children) => children.clone(),
            });
        }
        match association.pointer_location() {
            PointerLocation::Local => {
                let key_value = owner.attribute(association.key_column());
                let Some(id) = key_value.and_then(RecordId::from_value) else {
                    return Ok(vec![]);
                };
                let view = match association.polymorphism() {
                    Some(polymorphism) => {
                        let stored = owner
                            .attribute(&polymorphism.discriminator)
                            .and_then(Value::as_str)
                            .map(ViewName::new);
                        match stored {
                            Some(view) if association.accepts(&view) => view,
                            _ => return Ok(vec![]),
                        }
                    }
                    None => association
                        .target_view()
                        .expect("non-polymorphic association has one target")
                        .clone(),
                };
                let descriptor = self.registry.lookup(&view)?.clone();
                Ok(self
                    .txn
                    .find(descriptor.record_type(), &id)?
                    .map(|record| ViewModel::from_record(descriptor, record))
                    .into_iter()
                    .collect())
            }
            PointerLocation::Remote => {
                let Some(owner_id) = owner.id().cloned() else {
                    return Ok(vec![]);
                };
                let mut children = vec![];
                for view in association.accepted_views() {
                    let descriptor = self.registry.lookup(view)?.clone();
                    for record in self.txn.find_owned(
                        descriptor.record_type(),
                        association.key_column(),
                        &owner_id,
                    )? {
                        children.push(ViewModel::from_record(Arc::clone(&descriptor), record));
                    }
                }
                sort_for_output(&mut children);
                Ok(children)
            }
            PointerLocation::Through => {
                let through = association
                    .through_spec()
                    .expect("descriptor validated the through spec");
                let Some(owner_id) = owner.id().cloned() else {
                    return Ok(vec![]);
                };
                let join_descriptor = self.registry.lookup(&through.join_view)?.clone();
                let target_view = association
                    .target_view()
                    .expect("through associations have one target");
                let target_descriptor = self.registry.lookup(target_view)?.clone();
                let mut joins: Vec<ViewModel> = self
                    .txn
                    .find_owned(join_descriptor.record_type(), &through.source_key, &owner_id)?
                    .into_iter()
                    .map(|record| ViewModel::from_record(Arc::clone(&join_descriptor), record))
                    .collect();
                sort_for_output(&mut joins);
                let mut targets = vec![];
                for join in &joins {
                    let Some(target_id) = join
                        .attribute(&through.target_key)
                        .and_then(RecordId::from_value)
                    else {
                        continue;
                    };
                    if let Some(record) =
                        self.txn.find(target_descriptor.record_type(), &target_id)?
                    {
                        targets.push(ViewModel::from_record(
                            Arc::clone(&target_descriptor),
                            record,
                        ));
                    }
                }
                Ok(targets)
            }
        }
    }
}

/// Drops side-table entries that no `_ref` chain from the roots reaches.
pub fn prune_unreachable(data: &Value, references: &mut Map<String, Value>) {
    let mut root_keys = Vec::new();
    collect_ref_keys(data, &mut root_keys);
    let reachable: HashSet<String> = dag_walk::dfs(
        root_keys,
        |key: &String| key.clone(),
        |key| {
            let mut nested = Vec::new();
            if let Some(entry) = references.get(key) {
                collect_ref_keys(entry, &mut nested);
            }
            nested
        },
    )
    .collect();
    references.retain(|key, _| reachable.contains(key));
}

fn collect_ref_keys(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_ref_keys(item, out);
            }
        }
        Value::Object(node) => {
            if let Some(key) = wire::ref_key(value) {
                out.push(key.to_owned());
                return;
            }
            for nested in node.values() {
                collect_ref_keys(nested, out);
            }
        }
        _ => {}
    }
}

fn sort_for_output(children: &mut [ViewModel]) {
    let position = |vm: &ViewModel| -> Option<f64> {
        let column = vm.descriptor().list_attribute()?;
        vm.attribute(column).and_then(Value::as_f64)
    };
    if children.iter().all(|vm| position(vm).is_none()) {
        return;
    }
    children.sort_by(|a, b| {
        let (a, b) = (position(a), position(b));
        a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_prune_drops_unreachable_entries() {
        let data = json!({"_type": "Parent", "label": {"_ref": "a"}});
        let mut references = Map::new();
        references.insert("a".to_owned(), json!({"_type": "Label", "next": {"_ref": "b"}}));
        references.insert("b".to_owned(), json!({"_type": "Label"}));
        references.insert("stray".to_owned(), json!({"_type": "Label"}));
        prune_unreachable(&data, &mut references);
        assert!(references.contains_key("a"));
        assert!(references.contains_key("b"));
        assert!(!references.contains_key("stray"));
    }

    #[test]
    fn test_prune_keeps_nothing_without_refs() {
        let data = json!({"_type": "Parent"});
        let mut references = Map::new();
        references.insert("a".to_owned(), json!({"_type": "Label"}));
        prune_unreachable(&data, &mut references);
        assert!(references.is_empty());
    }
}
