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

//! The parsed form of a write request.
//!
//! The parser turns wire JSON into one [`UpdateData`] tree per root plus a
//! map of side-table entries; the planner consumes these without touching
//! raw JSON again. Attribute values are already decoded by their codecs.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::descriptor::ViewDescriptor;
use crate::record::RecordId;
use crate::reference::Reference;
use crate::reference::ReferenceKey;

/// A child position in an association update: either an inline subtree or a
/// key into the references side-table.
#[derive(Debug, Clone)]
pub enum ChildValue {
    Inline(UpdateData),
    Ref(ReferenceKey),
}

/// One functional edit action over a collection.
#[derive(Debug, Clone)]
pub enum FunctionalAction {
    Append {
        values: Vec<ChildValue>,
        /// Anchor element the block lands before/after; at most one is set.
        before: Option<ReferenceKey>,
        after: Option<ReferenceKey>,
    },
    Remove {
        values: Vec<ReferenceKey>,
    },
    Update {
        values: Vec<ChildValue>,
    },
}

#[derive(Debug, Clone)]
pub enum CollectionUpdate {
    /// The new ordered list is authoritative; missing previous children are
    /// released.
    Replace(Vec<ChildValue>),
    /// Edit actions over the current children.
    Functional(Vec<FunctionalAction>),
}

#[derive(Debug, Clone)]
pub enum AssociationUpdate {
    One(Option<ChildValue>),
    Collection(CollectionUpdate),
}

/// Parsed write request for a single node.
#[derive(Clone)]
pub struct UpdateData {
    pub descriptor: Arc<ViewDescriptor>,
    pub id: Option<RecordId>,
    /// New-record semantics: no id supplied, or `_new: true` forced them.
    pub new: bool,
    pub schema_version: u64,
    /// Wire attribute name to decoded value, in payload order.
    pub attributes: IndexMap<String, Value>,
    /// Association name to requested update, in payload order.
    pub associations: IndexMap<String, AssociationUpdate>,
}

impl Debug for UpdateData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateData")
            .field("reference", &self.reference())
            .field("new", &self.new)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .field("associations", &self.associations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UpdateData {
    /// An update that touches nothing, standing in for a current collection
    /// element the request did not explicitly edit.
    pub fn empty(descriptor: Arc<ViewDescriptor>, id: RecordId) -> Self {
        let schema_version = descriptor.schema_version();
        UpdateData {
            descriptor,
            id: Some(id),
            new: false,
            schema_version,
            attributes: IndexMap::new(),
            associations: IndexMap::new(),
        }
    }

    /// An update that creates a fresh record with nothing set yet; the
    /// planner uses it for synthesized join rows.
    pub fn new_record(descriptor: Arc<ViewDescriptor>) -> Self {
        let schema_version = descriptor.schema_version();
        UpdateData {
            descriptor,
            id: None,
            new: true,
            schema_version,
            attributes: IndexMap::new(),
            associations: IndexMap::new(),
        }
    }

    pub fn reference(&self) -> Reference {
        Reference::new(self.descriptor.name().clone(), self.id.clone())
    }

    pub fn is_noop(&self) -> bool {
        !self.new && self.attributes.is_empty() && self.associations.is_empty()
    }
}

/// Everything the parser hands to the planner.
#[derive(Debug)]
pub struct ParsedRequest {
    pub roots: Vec<UpdateData>,
    pub references: IndexMap<ReferenceKey, UpdateData>,
}
