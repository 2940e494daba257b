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

//! View descriptors.
//!
//! A descriptor is the declared shape of one view type: its attributes,
//! associations, schema version, ordering and locking columns, access
//! policy, callbacks, and migrations. Descriptors are built once through
//! [`ViewDescriptorBuilder`], validated, and immutable afterwards.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::access::Policy;
use crate::migration::Migration;
use crate::record::RecordData;
use crate::record::RecordId;
use crate::reference::ViewName;
use crate::store::StoreResult;
use crate::store::StoreTransaction;
use crate::value::Passthrough;
use crate::value::ValueCodec;
use crate::visitor::Callback;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("view {view}: schema version must be a positive integer")]
    InvalidVersion { view: ViewName },
    #[error("view {view}: duplicate member {name}")]
    DuplicateMember { view: ViewName, name: String },
    #[error("view {view}: reserved member name {name}")]
    ReservedMember { view: ViewName, name: String },
    #[error("view {view}: association {name}: {message}")]
    InvalidAssociation {
        view: ViewName,
        name: String,
        message: String,
    },
    #[error("view {view}: migration {from} -> {to}: {message}")]
    InvalidMigration {
        view: ViewName,
        from: u64,
        to: u64,
        message: String,
    },
}

#[derive(Clone)]
pub struct AttributeDescriptor {
    name: String,
    alias: Option<String>,
    codec: Arc<dyn ValueCodec>,
    read_only: bool,
    write_once: bool,
    array: bool,
    using: Option<Arc<ViewDescriptor>>,
}

impl Debug for AttributeDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDescriptor")
            .field("name", &self.name)
            .field("codec", &self.codec.name())
            .finish()
    }
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, codec: Arc<dyn ValueCodec>) -> Self {
        AttributeDescriptor {
            name: name.into(),
            alias: None,
            codec,
            read_only: false,
            write_once: false,
            array: false,
            using: None,
        }
    }

    /// An attribute decoded by the passthrough codec.
    pub fn any(name: impl Into<String>) -> Self {
        AttributeDescriptor::new(name, Arc::new(Passthrough))
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn write_once(mut self) -> Self {
        self.write_once = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    /// Stores the attribute under a different column name.
    pub fn aliased(mut self, column: impl Into<String>) -> Self {
        self.alias = Some(column.into());
        self
    }

    /// Validates structured values against a nested view descriptor.
    pub fn using(mut self, descriptor: Arc<ViewDescriptor>) -> Self {
        self.using = Some(descriptor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column the value is stored under.
    pub fn column(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn codec(&self) -> &Arc<dyn ValueCodec> {
        &self.codec
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_write_once(&self) -> bool {
        self.write_once
    }

    pub fn is_array(&self) -> bool {
        self.array
    }

    pub fn nested(&self) -> Option<&Arc<ViewDescriptor>> {
        self.using.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// Which record carries the association's foreign key. Drives save order:
/// a local pointer's child saves before the owner, a remote pointer's child
/// after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerLocation {
    Local,
    Remote,
    Through,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentPolicy {
    /// Remove the row and run the child's observing callbacks.
    Destroy,
    /// Remove the row without callbacks.
    Delete,
    /// Clear the inverse foreign key and leave the row in place.
    Detach,
}

#[derive(Debug, Clone)]
pub struct Polymorphism {
    pub accepted: Vec<ViewName>,
    /// Column storing the view name of the concrete child.
    pub discriminator: String,
}

#[derive(Debug, Clone)]
pub struct ThroughSpec {
    pub join_view: ViewName,
    /// Join column pointing at the owner.
    pub source_key: String,
    /// Join column pointing at the target.
    pub target_key: String,
}

/// Batch loader replacing the planner's default one-by-one record lookup
/// for an association.
pub trait ChildResolver: Send + Sync + Debug {
    fn resolve(
        &self,
        txn: &mut dyn StoreTransaction,
        table: &str,
        ids: &[RecordId],
    ) -> StoreResult<Vec<RecordData>>;
}

#[derive(Clone)]
pub struct AssociationDescriptor {
    name: String,
    cardinality: Cardinality,
    pointer: PointerLocation,
    foreign_key: Option<String>,
    accepted: Vec<ViewName>,
    polymorphism: Option<Polymorphism>,
    inverse: Option<String>,
    dependent: Option<DependentPolicy>,
    by_reference: bool,
    through: Option<ThroughSpec>,
}

impl Debug for AssociationDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationDescriptor")
            .field("name", &self.name)
            .field("cardinality", &self.cardinality)
            .field("pointer", &self.pointer)
            .finish()
    }
}

impl AssociationDescriptor {
    /// A single child whose foreign key lives on the owner.
    pub fn one(name: impl Into<String>, target: impl Into<ViewName>) -> Self {
        AssociationDescriptor {
            name: name.into(),
            cardinality: Cardinality::One,
            pointer: PointerLocation::Local,
            foreign_key: None,
            accepted: vec![target.into()],
            polymorphism: None,
            inverse: None,
            dependent: None,
            by_reference: false,
            through: None,
        }
    }

    /// A collection of children pointing back at the owner.
    pub fn many(name: impl Into<String>, target: impl Into<ViewName>) -> Self {
        AssociationDescriptor {
            name: name.into(),
            cardinality: Cardinality::Many,
            pointer: PointerLocation::Remote,
            foreign_key: None,
            accepted: vec![target.into()],
            polymorphism: None,
            inverse: None,
            dependent: None,
            by_reference: false,
            through: None,
        }
    }

    pub fn pointer(mut self, pointer: PointerLocation) -> Self {
        self.pointer = pointer;
        self
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    pub fn polymorphic(
        mut self,
        accepted: impl IntoIterator<Item = ViewName>,
        discriminator: impl Into<String>,
    ) -> Self {
        let accepted: Vec<ViewName> = accepted.into_iter().collect();
        self.accepted = accepted.clone();
        self.polymorphism = Some(Polymorphism {
            accepted,
            discriminator: discriminator.into(),
        });
        self
    }

    pub fn inverse(mut self, name: impl Into<String>) -> Self {
        self.inverse = Some(name.into());
        self
    }

    pub fn dependent(mut self, policy: DependentPolicy) -> Self {
        self.dependent = Some(policy);
        self
    }

    /// Children arrive as side-table references rather than inline trees.
    pub fn by_reference(mut self) -> Self {
        self.by_reference = true;
        self
    }

    pub fn through(
        mut self,
        join_view: impl Into<ViewName>,
        source_key: impl Into<String>,
        target_key: impl Into<String>,
    ) -> Self {
        self.pointer = PointerLocation::Through;
        self.through = Some(ThroughSpec {
            join_view: join_view.into(),
            source_key: source_key.into(),
            target_key: target_key.into(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn is_collection(&self) -> bool {
        self.cardinality == Cardinality::Many
    }

    pub fn pointer_location(&self) -> PointerLocation {
        self.pointer
    }

    /// Foreign-key column, resolved against the defaults at build time.
    pub fn key_column(&self) -> &str {
        self.foreign_key
            .as_deref()
            .expect("descriptor not finalized")
    }

    pub fn accepts(&self, view: &ViewName) -> bool {
        self.accepted.contains(view)
    }

    pub fn accepted_views(&self) -> &[ViewName] {
        &self.accepted
    }

    /// The sole target view of a non-polymorphic association.
    pub fn target_view(&self) -> Option<&ViewName> {
        match (&self.polymorphism, self.accepted.as_slice()) {
            (None, [single]) => Some(single),
            _ => None,
        }
    }

    pub fn polymorphism(&self) -> Option<&Polymorphism> {
        self.polymorphism.as_ref()
    }

    pub fn inverse_name(&self) -> Option<&str> {
        self.inverse.as_deref()
    }

    pub fn dependent_policy(&self) -> Option<DependentPolicy> {
        self.dependent
    }

    pub fn is_by_reference(&self) -> bool {
        self.by_reference
    }

    pub fn through_spec(&self) -> Option<&ThroughSpec> {
        self.through.as_ref()
    }
}

pub struct ViewDescriptor {
    name: ViewName,
    record_type: String,
    schema_version: u64,
    attributes: Vec<AttributeDescriptor>,
    associations: Vec<AssociationDescriptor>,
    list_attribute: Option<String>,
    lock_attribute: Option<String>,
    root: bool,
    policy: Policy,
    callbacks: Vec<Callback>,
    resolvers: HashMap<String, Arc<dyn ChildResolver>>,
    migrations: Vec<Migration>,
    compatible_versions: Vec<u64>,
    pub(crate) path_cache: Mutex<HashMap<(u64, u64), Option<Vec<usize>>>>,
}

impl Debug for ViewDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewDescriptor")
            .field("name", &self.name)
            .field("schema_version", &self.schema_version)
            .field("root", &self.root)
            .finish()
    }
}

impl ViewDescriptor {
    pub fn builder(name: impl Into<ViewName>) -> ViewDescriptorBuilder {
        ViewDescriptorBuilder::new(name)
    }

    pub fn name(&self) -> &ViewName {
        &self.name
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    pub fn associations(&self) -> &[AssociationDescriptor] {
        &self.associations
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDescriptor> {
        self.associations.iter().find(|a| a.name() == name)
    }

    pub fn list_attribute(&self) -> Option<&str> {
        self.list_attribute.as_deref()
    }

    pub fn lock_attribute(&self) -> Option<&str> {
        self.lock_attribute.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn callbacks(&self) -> &[Callback] {
        &self.callbacks
    }

    pub fn resolver(&self, association: &str) -> Option<&Arc<dyn ChildResolver>> {
        self.resolvers.get(association)
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Whether a client-supplied schema version is usable without
    /// migration.
    pub fn accepts_schema_version(&self, version: u64) -> bool {
        version == self.schema_version || self.compatible_versions.contains(&version)
    }

    /// Versions that appear anywhere in the migration graph.
    pub fn known_version(&self, version: u64) -> bool {
        version == self.schema_version
            || self.compatible_versions.contains(&version)
            || self
                .migrations
                .iter()
                .any(|m| m.from() == version || m.to() == version)
    }
}

pub struct ViewDescriptorBuilder {
    name: ViewName,
    record_type: Option<String>,
    schema_version: u64,
    attributes: Vec<AttributeDescriptor>,
    associations: Vec<AssociationDescriptor>,
    list_attribute: Option<String>,
    lock_attribute: Option<String>,
    root: bool,
    policy: Policy,
    callbacks: Vec<Callback>,
    resolvers: HashMap<String, Arc<dyn ChildResolver>>,
    migrations: Vec<Migration>,
    compatible_versions: Vec<u64>,
}

impl ViewDescriptorBuilder {
    pub fn new(name: impl Into<ViewName>) -> Self {
        ViewDescriptorBuilder {
            name: name.into(),
            record_type: None,
            schema_version: 1,
            attributes: vec![],
            associations: vec![],
            list_attribute: None,
            lock_attribute: None,
            root: false,
            policy: Policy::default(),
            callbacks: vec![],
            resolvers: HashMap::new(),
            migrations: vec![],
            compatible_versions: vec![],
        }
    }

    pub fn record_type(mut self, table: impl Into<String>) -> Self {
        self.record_type = Some(table.into());
        self
    }

    pub fn schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    pub fn root(mut self) -> Self {
        self.root = true;
        self
    }

    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn association(mut self, association: AssociationDescriptor) -> Self {
        self.associations.push(association);
        self
    }

    /// Column carrying list positions when this view is the element of an
    /// ordered collection.
    pub fn list_attribute(mut self, column: impl Into<String>) -> Self {
        self.list_attribute = Some(column.into());
        self
    }

    /// Column carrying the optimistic-lock version.
    pub fn lock_attribute(mut self, column: impl Into<String>) -> Self {
        self.lock_attribute = Some(column.into());
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn callback(mut self, callback: Callback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn resolver(
        mut self,
        association: impl Into<String>,
        resolver: Arc<dyn ChildResolver>,
    ) -> Self {
        self.resolvers.insert(association.into(), resolver);
        self
    }

    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Declares that views authored at `version` need no migration.
    pub fn compatible_version(mut self, version: u64) -> Self {
        self.compatible_versions.push(version);
        self
    }

    /// Copies another descriptor's attributes, associations, policy checks,
    /// and callbacks into this one, in their declared order.
    pub fn include(mut self, other: &ViewDescriptor) -> Self {
        self.attributes.extend(other.attributes.iter().cloned());
        self.associations.extend(other.associations.iter().cloned());
        self.policy.include(&other.policy);
        self.callbacks.extend(other.callbacks.iter().cloned());
        self
    }

    pub fn build(mut self) -> Result<Arc<ViewDescriptor>, DescriptorError> {
        if self.schema_version == 0 {
            return Err(DescriptorError::InvalidVersion { view: self.name.clone() });
        }
        let mut seen = std::collections::HashSet::new();
        for name in self
            .attributes
            .iter()
            .map(|a| a.name().to_owned())
            .chain(self.associations.iter().map(|a| a.name().to_owned()))
        {
            if name == "id" || name.starts_with('_') {
                return Err(DescriptorError::ReservedMember {
                    view: self.name.clone(),
                    name,
                });
            }
            if !seen.insert(name.clone()) {
                return Err(DescriptorError::DuplicateMember {
                    view: self.name.clone(),
                    name,
                });
            }
        }
        let record_type = self
            .record_type
            .take()
            .unwrap_or_else(|| self.name.as_str().to_lowercase());
        for association in &mut self.associations {
            if association.cardinality == Cardinality::Many
                && association.pointer == PointerLocation::Local
            {
                return Err(DescriptorError::InvalidAssociation {
                    view: self.name.clone(),
                    name: association.name.clone(),
                    message: "a collection cannot keep its pointer on the owner".to_owned(),
                });
            }
            if association.pointer == PointerLocation::Through {
                if association.through.is_none() {
                    return Err(DescriptorError::InvalidAssociation {
                        view: self.name.clone(),
                        name: association.name.clone(),
                        message: "through association without a join view".to_owned(),
                    });
                }
                if association.cardinality != Cardinality::Many {
                    return Err(DescriptorError::InvalidAssociation {
                        view: self.name.clone(),
                        name: association.name.clone(),
                        message: "through associations must be collections".to_owned(),
                    });
                }
            }
            if let Some(polymorphism) = &association.polymorphism {
                if polymorphism.accepted.is_empty() {
                    return Err(DescriptorError::InvalidAssociation {
                        view: self.name.clone(),
                        name: association.name.clone(),
                        message: "polymorphic association accepts no views".to_owned(),
                    });
                }
            }
            if association.foreign_key.is_none() {
                let default = match association.pointer {
                    PointerLocation::Local => format!("{}_id", association.name),
                    PointerLocation::Remote => match &association.inverse {
                        Some(inverse) => format!("{inverse}_id"),
                        None => format!("{record_type}_id"),
                    },
                    // Keys live on the join record.
                    PointerLocation::Through => String::new(),
                };
                association.foreign_key = Some(default);
            }
        }
        let mut edges = std::collections::HashSet::new();
        for migration in &self.migrations {
            let (from, to) = (migration.from(), migration.to());
            if from == 0 || to == 0 || from == to {
                return Err(DescriptorError::InvalidMigration {
                    view: self.name.clone(),
                    from,
                    to,
                    message: "endpoints must be distinct positive versions".to_owned(),
                });
            }
            if !edges.insert((from, to)) {
                return Err(DescriptorError::InvalidMigration {
                    view: self.name.clone(),
                    from,
                    to,
                    message: "duplicate migration".to_owned(),
                });
            }
        }
        Ok(Arc::new(ViewDescriptor {
            name: self.name,
            record_type,
            schema_version: self.schema_version,
            attributes: self.attributes,
            associations: self.associations,
            list_attribute: self.list_attribute,
            lock_attribute: self.lock_attribute,
            root: self.root,
            policy: self.policy,
            callbacks: self.callbacks,
            resolvers: self.resolvers,
            migrations: self.migrations,
            compatible_versions: self.compatible_versions,
            path_cache: Mutex::new(HashMap::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::value;

    #[test]
    fn test_builder_defaults() {
        let descriptor = ViewDescriptor::builder("Parent").build().unwrap();
        assert_eq!(descriptor.record_type(), "parent");
        assert_eq!(descriptor.schema_version(), 1);
        assert!(!descriptor.is_root());
    }

    #[test]
    fn test_attribute_column_alias() {
        let descriptor = ViewDescriptor::builder("Parent")
            .attribute(AttributeDescriptor::new("name", Arc::new(value::Text)).aliased("full_name"))
            .build()
            .unwrap();
        let attribute = descriptor.attribute("name").unwrap();
        assert_eq!(attribute.column(), "full_name");
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let err = ViewDescriptor::builder("Parent")
            .attribute(AttributeDescriptor::any("name"))
            .association(AssociationDescriptor::one("name", "Child"))
            .build()
            .unwrap_err();
        assert_matches!(err, DescriptorError::DuplicateMember { name, .. } if name == "name");
    }

    #[test]
    fn test_reserved_member_rejected() {
        let err = ViewDescriptor::builder("Parent")
            .attribute(AttributeDescriptor::any("_type"))
            .build()
            .unwrap_err();
        assert_matches!(err, DescriptorError::ReservedMember { .. });
    }

    #[test]
    fn test_collection_with_local_pointer_rejected() {
        let err = ViewDescriptor::builder("Parent")
            .association(
                AssociationDescriptor::many("children", "Child").pointer(PointerLocation::Local),
            )
            .build()
            .unwrap_err();
        assert_matches!(err, DescriptorError::InvalidAssociation { .. });
    }

    #[test]
    fn test_foreign_key_defaults() {
        let descriptor = ViewDescriptor::builder("Parent")
            .association(AssociationDescriptor::one("child", "Child"))
            .association(AssociationDescriptor::many("children", "Child").inverse("parent"))
            .association(AssociationDescriptor::many("others", "Child"))
            .build()
            .unwrap();
        assert_eq!(descriptor.association("child").unwrap().key_column(), "child_id");
        assert_eq!(
            descriptor.association("children").unwrap().key_column(),
            "parent_id"
        );
        assert_eq!(
            descriptor.association("others").unwrap().key_column(),
            "parent_id"
        );
    }

    #[test]
    fn test_include_copies_members() {
        let base = ViewDescriptor::builder("Base")
            .attribute(AttributeDescriptor::any("name"))
            .build()
            .unwrap();
        let derived = ViewDescriptor::builder("Derived")
            .include(&base)
            .attribute(AttributeDescriptor::any("rank"))
            .build()
            .unwrap();
        let names: Vec<_> = derived.attributes().iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["name", "rank"]);
    }

    #[test]
    fn test_version_zero_rejected() {
        let err = ViewDescriptor::builder("Parent")
            .schema_version(0)
            .build()
            .unwrap_err();
        assert_matches!(err, DescriptorError::InvalidVersion { .. });
    }
}
