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

//! Wire-shape validation.
//!
//! Turns an incoming payload (one view object or an array of them) plus the
//! references side-table into normalized [`UpdateData`] trees. Attribute
//! values are decoded here; structural rules about the side-table (every
//! used key present, no unused keys, no two keys naming one record) are
//! enforced here; everything that needs the current store state (read-only
//! comparisons, release and claim, functional-update membership) is left to
//! the planner.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::descriptor::AssociationDescriptor;
use crate::descriptor::AttributeDescriptor;
use crate::descriptor::ViewDescriptor;
use crate::record::RecordId;
use crate::reference::Reference;
use crate::reference::ReferenceKey;
use crate::reference::ViewName;
use crate::registry::RegistryError;
use crate::registry::ViewRegistry;
use crate::update_data::AssociationUpdate;
use crate::update_data::ChildValue;
use crate::update_data::CollectionUpdate;
use crate::update_data::FunctionalAction;
use crate::update_data::ParsedRequest;
use crate::update_data::UpdateData;
use crate::value;
use crate::wire;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid structure: {detail}")]
    InvalidStructure { detail: String },
    #[error("view {0} cannot appear at the top level")]
    NonRootType(ViewName),
    #[error("view {view} does not accept schema version {version}")]
    SchemaVersionMismatch { view: ViewName, version: u64 },
    #[error("{view}: id must be an integer or a string")]
    InvalidId { view: ViewName },
    #[error("{view} has no attribute or association {attribute}")]
    UnknownAttribute { view: ViewName, attribute: String },
    #[error("{view}.{attribute}: {detail}")]
    Validation {
        view: ViewName,
        attribute: String,
        detail: String,
    },
    #[error("{view}.{attribute} is read-only")]
    ReadOnlyAttribute { view: ViewName, attribute: String },
    #[error("{view}.{attribute}: expected {expected}, got {provided}")]
    InvalidAttributeType {
        view: ViewName,
        attribute: String,
        expected: String,
        provided: String,
    },
    #[error("{view}.{association} does not accept {provided}")]
    TypeMismatch {
        view: ViewName,
        association: String,
        provided: ViewName,
    },
    #[error("duplicate root {0}")]
    DuplicateRoot(Reference),
    #[error("keys {first} and {second} both name {reference}")]
    DuplicateReference {
        first: ReferenceKey,
        second: ReferenceKey,
        reference: Reference,
    },
    #[error("reference key {0} is not present in the side-table")]
    UnresolvedReference(ReferenceKey),
    #[error("reference key {0} is never used")]
    UnusedReference(ReferenceKey),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ParseError {
    fn structure(detail: impl Into<String>) -> Self {
        ParseError::InvalidStructure {
            detail: detail.into(),
        }
    }
}

/// What kind of slot a view object was found in.
enum Slot<'a> {
    Root,
    SideTable,
    Child {
        owner: &'a ViewName,
        association: &'a AssociationDescriptor,
    },
}

pub struct Parser<'a> {
    registry: &'a ViewRegistry,
}

impl<'a> Parser<'a> {
    pub fn new(registry: &'a ViewRegistry) -> Self {
        Parser { registry }
    }

    pub fn parse(
        &self,
        payload: &Value,
        references: &Map<String, Value>,
    ) -> Result<ParsedRequest, ParseError> {
        let mut state = ParseState {
            registry: self.registry,
            used_keys: HashSet::new(),
        };

        let root_values: Vec<&Value> = match payload {
            Value::Object(_) => vec![payload],
            Value::Array(items) => items.iter().collect(),
            _ => {
                return Err(ParseError::structure(
                    "expected a view object or an array of view objects",
                ))
            }
        };
        let mut roots = Vec::with_capacity(root_values.len());
        let mut root_identities = HashSet::new();
        for value in root_values {
            let node = value
                .as_object()
                .ok_or_else(|| ParseError::structure("roots must be view objects"))?;
            if wire::is_ref(value) {
                return Err(ParseError::structure(
                    "a root cannot be a side-table reference",
                ));
            }
            let root = state.parse_view(node, Slot::Root)?;
            if root.id.is_some() && !root_identities.insert(root.reference()) {
                return Err(ParseError::DuplicateRoot(root.reference()));
            }
            roots.push(root);
        }

        let mut parsed_references = IndexMap::new();
        for (key, value) in references {
            let node = value
                .as_object()
                .filter(|_| !wire::is_ref(value))
                .ok_or_else(|| {
                    ParseError::structure(format!("side-table entry {key} must be a view object"))
                })?;
            let entry = state.parse_view(node, Slot::SideTable)?;
            parsed_references.insert(ReferenceKey::new(key.clone()), entry);
        }

        // Side-table keys must resolve, be used, and denote distinct records.
        for key in &state.used_keys {
            if !parsed_references.contains_key(key) {
                return Err(ParseError::UnresolvedReference(key.clone()));
            }
        }
        for key in parsed_references.keys() {
            if !state.used_keys.contains(key) {
                return Err(ParseError::UnusedReference(key.clone()));
            }
        }
        let mut identities: HashMap<Reference, &ReferenceKey> = HashMap::new();
        for (key, entry) in &parsed_references {
            if entry.id.is_none() {
                continue;
            }
            if let Some(first) = identities.insert(entry.reference(), key) {
                return Err(ParseError::DuplicateReference {
                    first: first.clone(),
                    second: key.clone(),
                    reference: entry.reference(),
                });
            }
        }

        Ok(ParsedRequest {
            roots,
            references: parsed_references,
        })
    }
}

struct ParseState<'a> {
    registry: &'a ViewRegistry,
    used_keys: HashSet<ReferenceKey>,
}

impl ParseState<'_> {
    fn parse_view(
        &mut self,
        node: &Map<String, Value>,
        slot: Slot<'_>,
    ) -> Result<UpdateData, ParseError> {
        let descriptor = self.slot_descriptor(node, &slot)?;
        let view = descriptor.name().clone();

        let schema_version = match node.get(wire::VERSION) {
            None => descriptor.schema_version(),
            Some(value) => {
                let version = value
                    .as_u64()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| ParseError::structure(format!(
                        "{view}: {} must be a positive integer",
                        wire::VERSION
                    )))?;
                if !descriptor.accepts_schema_version(version) {
                    return Err(ParseError::SchemaVersionMismatch { view, version });
                }
                version
            }
        };

        let id = match node.get(wire::ID) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                RecordId::from_value(value).ok_or_else(|| ParseError::InvalidId {
                    view: view.clone(),
                })?,
            ),
        };
        let forced_new = match node.get(wire::NEW) {
            None => false,
            Some(Value::Bool(forced)) => *forced,
            Some(_) => {
                return Err(ParseError::structure(format!(
                    "{view}: {} must be a boolean",
                    wire::NEW
                )))
            }
        };
        let new = forced_new || id.is_none();

        let mut attributes = IndexMap::new();
        let mut associations = IndexMap::new();
        for (key, value) in node {
            if wire::is_reserved_key(key) {
                continue;
            }
            if let Some(attribute) = descriptor.attribute(key) {
                let decoded = self.decode_attribute(&view, attribute, value)?;
                attributes.insert(key.clone(), decoded);
            } else if let Some(association) = descriptor.association(key) {
                let update = self.parse_association(&view, association, value)?;
                associations.insert(key.clone(), update);
            } else {
                return Err(ParseError::UnknownAttribute {
                    view,
                    attribute: key.clone(),
                });
            }
        }

        // Read-only and write-once values on a new record have nothing to
        // be compared against, so they are rejected outright. On existing
        // records the planner compares against the loaded row.
        if new {
            for attribute in descriptor.attributes() {
                if attribute.is_read_only() && attributes.contains_key(attribute.name()) {
                    return Err(ParseError::ReadOnlyAttribute {
                        view: descriptor.name().clone(),
                        attribute: attribute.name().to_owned(),
                    });
                }
            }
        }

        Ok(UpdateData {
            descriptor,
            id,
            new,
            schema_version,
            attributes,
            associations,
        })
    }

    fn slot_descriptor(
        &self,
        node: &Map<String, Value>,
        slot: &Slot<'_>,
    ) -> Result<Arc<ViewDescriptor>, ParseError> {
        let declared = match wire::type_of(node) {
            Some(name) if wire::is_reserved_type(name) => {
                return Err(ParseError::structure(format!(
                    "{name} is not a view type here"
                )))
            }
            Some(name) => Some(ViewName::new(name)),
            None => match node.get(wire::TYPE) {
                Some(_) => {
                    return Err(ParseError::structure(format!(
                        "{} must be a string",
                        wire::TYPE
                    )))
                }
                None => None,
            },
        };
        match slot {
            Slot::Root | Slot::SideTable => {
                let name = declared.ok_or_else(|| {
                    ParseError::structure(format!("view object must declare {}", wire::TYPE))
                })?;
                let descriptor = self.registry.lookup(&name)?.clone();
                if matches!(slot, Slot::Root) && !descriptor.is_root() {
                    return Err(ParseError::NonRootType(name));
                }
                Ok(descriptor)
            }
            Slot::Child { owner, association } => match association.polymorphism() {
                Some(_) => {
                    let name = declared.ok_or_else(|| {
                        ParseError::structure(format!(
                            "{owner}.{}: polymorphic children must declare {}",
                            association.name(),
                            wire::TYPE
                        ))
                    })?;
                    if !association.accepts(&name) {
                        return Err(ParseError::TypeMismatch {
                            view: (*owner).clone(),
                            association: association.name().to_owned(),
                            provided: name,
                        });
                    }
                    Ok(self.registry.lookup(&name)?.clone())
                }
                None => {
                    let target = association
                        .target_view()
                        .expect("non-polymorphic association has one target");
                    if let Some(name) = declared {
                        if &name != target {
                            return Err(ParseError::TypeMismatch {
                                view: (*owner).clone(),
                                association: association.name().to_owned(),
                                provided: name,
                            });
                        }
                    }
                    Ok(self.registry.lookup(target)?.clone())
                }
            },
        }
    }

    fn decode_attribute(
        &self,
        view: &ViewName,
        attribute: &AttributeDescriptor,
        raw: &Value,
    ) -> Result<Value, ParseError> {
        if attribute.is_array() {
            let items = match raw {
                Value::Null => return Ok(Value::Null),
                Value::Array(items) => items,
                _ => {
                    return Err(ParseError::InvalidAttributeType {
                        view: view.clone(),
                        attribute: attribute.name().to_owned(),
                        expected: "array".to_owned(),
                        provided: value::type_name(raw).to_owned(),
                    })
                }
            };
            let decoded: Vec<Value> = items
                .iter()
                .map(|item| self.decode_scalar(view, attribute, item))
                .collect::<Result<_, _>>()?;
            return Ok(Value::Array(decoded));
        }
        self.decode_scalar(view, attribute, raw)
    }

    fn decode_scalar(
        &self,
        view: &ViewName,
        attribute: &AttributeDescriptor,
        raw: &Value,
    ) -> Result<Value, ParseError> {
        if let Some(nested) = attribute.nested() {
            return self.decode_structured(view, attribute, nested, raw);
        }
        attribute
            .codec()
            .decode(raw)
            .map_err(|err| ParseError::Validation {
                view: view.clone(),
                attribute: attribute.name().to_owned(),
                detail: err.to_string(),
            })
    }

    /// Structured values validate against the nested descriptor's
    /// attributes and stay JSON objects on the record.
    fn decode_structured(
        &self,
        view: &ViewName,
        attribute: &AttributeDescriptor,
        nested: &ViewDescriptor,
        raw: &Value,
    ) -> Result<Value, ParseError> {
        let node = match raw {
            Value::Null => return Ok(Value::Null),
            Value::Object(node) => node,
            _ => {
                return Err(ParseError::InvalidAttributeType {
                    view: view.clone(),
                    attribute: attribute.name().to_owned(),
                    expected: "object".to_owned(),
                    provided: value::type_name(raw).to_owned(),
                })
            }
        };
        let mut decoded = Map::new();
        for (key, nested_value) in node {
            if wire::is_reserved_key(key) {
                continue;
            }
            let nested_attribute =
                nested
                    .attribute(key)
                    .ok_or_else(|| ParseError::UnknownAttribute {
                        view: nested.name().clone(),
                        attribute: key.clone(),
                    })?;
            decoded.insert(
                key.clone(),
                self.decode_attribute(nested.name(), nested_attribute, nested_value)?,
            );
        }
        Ok(Value::Object(decoded))
    }

    fn parse_association(
        &mut self,
        view: &ViewName,
        association: &AssociationDescriptor,
        raw: &Value,
    ) -> Result<AssociationUpdate, ParseError> {
        if association.is_collection() {
            if wire::is_functional_update(raw) {
                let actions = self.parse_functional(view, association, raw)?;
                return Ok(AssociationUpdate::Collection(CollectionUpdate::Functional(
                    actions,
                )));
            }
            let items = raw.as_array().ok_or_else(|| {
                ParseError::structure(format!(
                    "{view}.{}: a collection takes an array or a functional update",
                    association.name()
                ))
            })?;
            let children = items
                .iter()
                .map(|item| self.parse_child(view, association, item, false))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(AssociationUpdate::Collection(CollectionUpdate::Replace(
                children,
            )));
        }
        match raw {
            Value::Null => Ok(AssociationUpdate::One(None)),
            Value::Object(_) => {
                let child = self.parse_child(view, association, raw, false)?;
                Ok(AssociationUpdate::One(Some(child)))
            }
            _ => Err(ParseError::structure(format!(
                "{view}.{}: a single association takes an object or null",
                association.name()
            ))),
        }
    }

    /// One child slot. Inside functional-update values (`functional`),
    /// side-table references are always legal because actions address
    /// existing elements through them; elsewhere a reference requires the
    /// association to be declared by-reference.
    fn parse_child(
        &mut self,
        view: &ViewName,
        association: &AssociationDescriptor,
        raw: &Value,
        functional: bool,
    ) -> Result<ChildValue, ParseError> {
        if let Some(key) = wire::ref_key(raw) {
            if !association.is_by_reference() && !functional {
                return Err(ParseError::structure(format!(
                    "{view}.{}: {} is only accepted by by-reference associations",
                    association.name(),
                    wire::REF
                )));
            }
            let key = ReferenceKey::new(key);
            self.used_keys.insert(key.clone());
            return Ok(ChildValue::Ref(key));
        }
        if association.is_by_reference() {
            return Err(ParseError::structure(format!(
                "{view}.{}: children of a by-reference association arrive in the side-table",
                association.name()
            )));
        }
        let node = raw.as_object().ok_or_else(|| {
            ParseError::structure(format!(
                "{view}.{}: expected a view object",
                association.name()
            ))
        })?;
        let child = self.parse_view(
            node,
            Slot::Child {
                owner: view,
                association,
            },
        )?;
        Ok(ChildValue::Inline(child))
    }

    fn parse_functional(
        &mut self,
        view: &ViewName,
        association: &AssociationDescriptor,
        raw: &Value,
    ) -> Result<Vec<FunctionalAction>, ParseError> {
        let wrapper = raw.as_object().expect("caller checked the wrapper shape");
        for key in wrapper.keys() {
            if key != wire::TYPE && key != wire::ACTIONS {
                return Err(ParseError::structure(format!(
                    "{view}.{}: unexpected key {key} in a functional update",
                    association.name()
                )));
            }
        }
        let actions = wrapper
            .get(wire::ACTIONS)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ParseError::structure(format!(
                    "{view}.{}: a functional update requires an {} array",
                    association.name(),
                    wire::ACTIONS
                ))
            })?;
        actions
            .iter()
            .map(|action| self.parse_action(view, association, action))
            .collect()
    }

    fn parse_action(
        &mut self,
        view: &ViewName,
        association: &AssociationDescriptor,
        raw: &Value,
    ) -> Result<FunctionalAction, ParseError> {
        let node = raw.as_object().ok_or_else(|| {
            ParseError::structure(format!(
                "{view}.{}: actions must be objects",
                association.name()
            ))
        })?;
        let kind = wire::type_of(node).ok_or_else(|| {
            ParseError::structure(format!(
                "{view}.{}: actions must declare {}",
                association.name(),
                wire::TYPE
            ))
        })?;
        let values = node
            .get(wire::VALUES)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ParseError::structure(format!(
                    "{view}.{}: {kind} requires a {} array",
                    association.name(),
                    wire::VALUES
                ))
            })?;
        match kind {
            wire::ACTION_APPEND => {
                let parsed = values
                    .iter()
                    .map(|item| self.parse_child(view, association, item, true))
                    .collect::<Result<Vec<_>, _>>()?;
                let before = self.parse_anchor(view, association, node.get(wire::BEFORE))?;
                let after = self.parse_anchor(view, association, node.get(wire::AFTER))?;
                if before.is_some() && after.is_some() {
                    return Err(ParseError::structure(format!(
                        "{view}.{}: append takes at most one anchor",
                        association.name()
                    )));
                }
                Ok(FunctionalAction::Append {
                    values: parsed,
                    before,
                    after,
                })
            }
            wire::ACTION_REMOVE => {
                let keys = values
                    .iter()
                    .map(|item| {
                        wire::ref_key(item).map(ReferenceKey::new).ok_or_else(|| {
                            ParseError::structure(format!(
                                "{view}.{}: remove accepts only references",
                                association.name()
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.used_keys.extend(keys.iter().cloned());
                Ok(FunctionalAction::Remove { values: keys })
            }
            wire::ACTION_UPDATE => {
                let parsed = values
                    .iter()
                    .map(|item| {
                        let child = self.parse_child(view, association, item, true)?;
                        if let ChildValue::Inline(update) = &child {
                            if update.id.is_none() {
                                return Err(ParseError::structure(format!(
                                    "{view}.{}: update addresses existing elements",
                                    association.name()
                                )));
                            }
                        }
                        Ok(child)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FunctionalAction::Update { values: parsed })
            }
            other => Err(ParseError::structure(format!(
                "{view}.{}: unknown action {other}",
                association.name()
            ))),
        }
    }

    fn parse_anchor(
        &mut self,
        view: &ViewName,
        association: &AssociationDescriptor,
        raw: Option<&Value>,
    ) -> Result<Option<ReferenceKey>, ParseError> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let key = wire::ref_key(raw).map(ReferenceKey::new).ok_or_else(|| {
            ParseError::structure(format!(
                "{view}.{}: anchors must be references",
                association.name()
            ))
        })?;
        self.used_keys.insert(key.clone());
        Ok(Some(key))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::descriptor::AssociationDescriptor;
    use crate::descriptor::AttributeDescriptor;
    use crate::value::Integer;
    use crate::value::Text;

    fn test_registry() -> ViewRegistry {
        let mut registry = ViewRegistry::new();
        registry
            .register(
                ViewDescriptor::builder("Child")
                    .attribute(AttributeDescriptor::new("name", Arc::new(Text)))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ViewDescriptor::builder("Label")
                    .attribute(AttributeDescriptor::new("text", Arc::new(Text)))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ViewDescriptor::builder("Parent")
                    .root()
                    .attribute(AttributeDescriptor::new("name", Arc::new(Text)))
                    .attribute(AttributeDescriptor::new("rank", Arc::new(Integer)))
                    .attribute(AttributeDescriptor::new("tags", Arc::new(Text)).array())
                    .attribute(
                        AttributeDescriptor::new("created_at", Arc::new(Text)).read_only(),
                    )
                    .association(AssociationDescriptor::one("child", "Child"))
                    .association(AssociationDescriptor::many("children", "Child").inverse("parent"))
                    .association(
                        AssociationDescriptor::many("labels", "Label")
                            .inverse("parent")
                            .by_reference(),
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn parse(payload: Value) -> Result<ParsedRequest, ParseError> {
        parse_with_refs(payload, json!({}))
    }

    fn parse_with_refs(payload: Value, references: Value) -> Result<ParsedRequest, ParseError> {
        let registry = test_registry();
        let references = references.as_object().unwrap().clone();
        Parser::new(&registry).parse(&payload, &references)
    }

    #[test]
    fn test_parses_root_with_attributes() {
        let parsed = parse(json!({"_type": "Parent", "name": "p", "rank": 3})).unwrap();
        assert_eq!(parsed.roots.len(), 1);
        let root = &parsed.roots[0];
        assert!(root.new);
        assert_eq!(root.attributes["name"], json!("p"));
        assert_eq!(root.attributes["rank"], json!(3));
    }

    #[test]
    fn test_root_must_declare_type() {
        let err = parse(json!({"name": "p"})).unwrap_err();
        assert_matches!(err, ParseError::InvalidStructure { .. });
    }

    #[test]
    fn test_root_must_be_registered_and_root() {
        let err = parse(json!({"_type": "Nope"})).unwrap_err();
        assert_matches!(err, ParseError::Registry(RegistryError::UnknownView(_)));

        let err = parse(json!({"_type": "Child", "name": "c"})).unwrap_err();
        assert_matches!(err, ParseError::NonRootType(name) if name.as_str() == "Child");
    }

    #[test]
    fn test_unknown_attribute() {
        let err = parse(json!({"_type": "Parent", "nope": 1})).unwrap_err();
        assert_matches!(err, ParseError::UnknownAttribute { attribute, .. } if attribute == "nope");
    }

    #[test]
    fn test_codec_failure_is_validation() {
        let err = parse(json!({"_type": "Parent", "rank": "high"})).unwrap_err();
        assert_matches!(err, ParseError::Validation { attribute, .. } if attribute == "rank");
    }

    #[test]
    fn test_array_attribute_requires_array() {
        let err = parse(json!({"_type": "Parent", "tags": "solo"})).unwrap_err();
        assert_matches!(
            err,
            ParseError::InvalidAttributeType { expected, provided, .. }
                if expected == "array" && provided == "string"
        );
        let parsed = parse(json!({"_type": "Parent", "tags": ["a", "b"]})).unwrap();
        assert_eq!(parsed.roots[0].attributes["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_read_only_attribute_rejected_on_new_record() {
        let err = parse(json!({"_type": "Parent", "created_at": "now"})).unwrap_err();
        assert_matches!(err, ParseError::ReadOnlyAttribute { attribute, .. } if attribute == "created_at");
        // On an existing record the value parses; the planner compares it.
        parse(json!({"_type": "Parent", "id": 1, "created_at": "now"})).unwrap();
    }

    #[test]
    fn test_id_shapes() {
        let parsed = parse(json!({"_type": "Parent", "id": 7})).unwrap();
        assert_eq!(parsed.roots[0].id, Some(RecordId::Int(7)));
        assert!(!parsed.roots[0].new);

        let parsed = parse(json!({"_type": "Parent", "id": "k7", "_new": true})).unwrap();
        assert!(parsed.roots[0].new);
        assert_eq!(parsed.roots[0].id, Some(RecordId::Text("k7".to_owned())));

        let err = parse(json!({"_type": "Parent", "id": 1.5})).unwrap_err();
        assert_matches!(err, ParseError::InvalidId { .. });
    }

    #[test]
    fn test_schema_version_mismatch() {
        let err = parse(json!({"_type": "Parent", "_version": 9})).unwrap_err();
        assert_matches!(err, ParseError::SchemaVersionMismatch { version: 9, .. });
    }

    #[test]
    fn test_single_association_shapes() {
        let parsed = parse(json!({"_type": "Parent", "child": {"name": "c"}})).unwrap();
        assert_matches!(
            &parsed.roots[0].associations["child"],
            AssociationUpdate::One(Some(ChildValue::Inline(_)))
        );

        let parsed = parse(json!({"_type": "Parent", "child": null})).unwrap();
        assert_matches!(
            &parsed.roots[0].associations["child"],
            AssociationUpdate::One(None)
        );

        let err = parse(json!({"_type": "Parent", "child": [1]})).unwrap_err();
        assert_matches!(err, ParseError::InvalidStructure { .. });
    }

    #[test]
    fn test_child_type_mismatch() {
        let err = parse(json!({"_type": "Parent", "child": {"_type": "Label"}})).unwrap_err();
        assert_matches!(
            err,
            ParseError::TypeMismatch { provided, .. } if provided.as_str() == "Label"
        );
    }

    #[test]
    fn test_collection_requires_array() {
        let err = parse(json!({"_type": "Parent", "children": {"name": "c"}})).unwrap_err();
        assert_matches!(err, ParseError::InvalidStructure { .. });
    }

    #[test]
    fn test_ref_requires_by_reference_association() {
        let err = parse_with_refs(
            json!({"_type": "Parent", "children": [{"_ref": "a"}]}),
            json!({"a": {"_type": "Child", "id": 1}}),
        )
        .unwrap_err();
        assert_matches!(err, ParseError::InvalidStructure { .. });

        let parsed = parse_with_refs(
            json!({"_type": "Parent", "labels": [{"_ref": "a"}]}),
            json!({"a": {"_type": "Label", "id": 1}}),
        )
        .unwrap();
        assert_matches!(
            &parsed.roots[0].associations["labels"],
            AssociationUpdate::Collection(CollectionUpdate::Replace(children))
                if matches!(&children[0], ChildValue::Ref(_))
        );
    }

    #[test]
    fn test_by_reference_association_rejects_inline() {
        let err = parse(json!({"_type": "Parent", "labels": [{"_type": "Label"}]})).unwrap_err();
        assert_matches!(err, ParseError::InvalidStructure { .. });
    }

    #[test]
    fn test_unresolved_and_unused_references() {
        let err = parse_with_refs(
            json!({"_type": "Parent", "labels": [{"_ref": "missing"}]}),
            json!({}),
        )
        .unwrap_err();
        assert_matches!(err, ParseError::UnresolvedReference(key) if key.as_str() == "missing");

        let err = parse_with_refs(
            json!({"_type": "Parent"}),
            json!({"stray": {"_type": "Label", "id": 1}}),
        )
        .unwrap_err();
        assert_matches!(err, ParseError::UnusedReference(key) if key.as_str() == "stray");
    }

    #[test]
    fn test_two_keys_for_one_record_rejected() {
        let err = parse_with_refs(
            json!({"_type": "Parent", "labels": [{"_ref": "a"}, {"_ref": "b"}]}),
            json!({
                "a": {"_type": "Label", "id": 1},
                "b": {"_type": "Label", "id": 1},
            }),
        )
        .unwrap_err();
        assert_matches!(err, ParseError::DuplicateReference { .. });
    }

    #[test]
    fn test_duplicate_roots_rejected() {
        let err = parse(json!([
            {"_type": "Parent", "id": 1},
            {"_type": "Parent", "id": 1},
        ]))
        .unwrap_err();
        assert_matches!(err, ParseError::DuplicateRoot(_));
    }

    #[test]
    fn test_functional_update_parses() {
        let parsed = parse_with_refs(
            json!({"_type": "Parent", "children": {"_type": "_update", "actions": [
                {"_type": "append", "values": [{"name": "new"}], "before": {"_ref": "c2"}},
                {"_type": "remove", "values": [{"_ref": "c3"}]},
                {"_type": "update", "values": [{"id": 4, "name": "edited"}]},
            ]}}),
            json!({
                "c2": {"_type": "Child", "id": 2},
                "c3": {"_type": "Child", "id": 3},
            }),
        )
        .unwrap();
        let AssociationUpdate::Collection(CollectionUpdate::Functional(actions)) =
            &parsed.roots[0].associations["children"]
        else {
            panic!("expected functional update");
        };
        assert_eq!(actions.len(), 3);
        assert_matches!(
            &actions[0],
            FunctionalAction::Append { before: Some(key), after: None, .. }
                if key.as_str() == "c2"
        );
        assert_matches!(&actions[1], FunctionalAction::Remove { values } if values.len() == 1);
    }

    #[test]
    fn test_remove_accepts_only_references() {
        let err = parse(json!({"_type": "Parent", "children": {"_type": "_update", "actions": [
            {"_type": "remove", "values": [{"id": 3}]},
        ]}}))
        .unwrap_err();
        assert_matches!(err, ParseError::InvalidStructure { detail } if detail.contains("remove"));
    }

    #[test]
    fn test_update_requires_existing_elements() {
        let err = parse(json!({"_type": "Parent", "children": {"_type": "_update", "actions": [
            {"_type": "update", "values": [{"name": "fresh"}]},
        ]}}))
        .unwrap_err();
        assert_matches!(err, ParseError::InvalidStructure { .. });
    }

    #[test]
    fn test_append_with_both_anchors_rejected() {
        let err = parse_with_refs(
            json!({"_type": "Parent", "children": {"_type": "_update", "actions": [
                {"_type": "append", "values": [],
                 "before": {"_ref": "a"}, "after": {"_ref": "a"}},
            ]}}),
            json!({"a": {"_type": "Child", "id": 1}}),
        )
        .unwrap_err();
        assert_matches!(err, ParseError::InvalidStructure { detail } if detail.contains("anchor"));
    }

    #[test]
    fn test_structured_attribute_validates_nested_shape() {
        let mut registry = test_registry();
        let point = ViewDescriptor::builder("Point")
            .attribute(AttributeDescriptor::new("x", Arc::new(Integer)))
            .attribute(AttributeDescriptor::new("y", Arc::new(Integer)))
            .build()
            .unwrap();
        registry
            .register(
                ViewDescriptor::builder("Place")
                    .root()
                    .attribute(AttributeDescriptor::any("origin").using(point))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let parser = Parser::new(&registry);
        parser
            .parse(
                &json!({"_type": "Place", "origin": {"x": 1, "y": 2}}),
                &Map::new(),
            )
            .unwrap();
        let err = parser
            .parse(
                &json!({"_type": "Place", "origin": {"x": 1, "z": 2}}),
                &Map::new(),
            )
            .unwrap_err();
        assert_matches!(err, ParseError::UnknownAttribute { attribute, .. } if attribute == "z");
    }
}
