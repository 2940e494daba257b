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

//! A view descriptor bound to one record.
//!
//! The viewmodel carries the record's column values, tracks which columns a
//! request has dirtied, and caches resolved child viewmodels so a response
//! can be rendered without reloading the store.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use serde_json::Value;

use crate::descriptor::ViewDescriptor;
use crate::record::RecordData;
use crate::record::RecordId;
use crate::reference::Reference;

/// Resolved children of one association, cached after a save.
#[derive(Debug, Clone)]
pub enum AssociationCache {
    One(Option<Box<ViewModel>>),
    Many(Vec<ViewModel>),
}

#[derive(Clone)]
pub struct ViewModel {
    descriptor: Arc<ViewDescriptor>,
    record: RecordData,
    persisted: bool,
    dirty: BTreeSet<String>,
    associations: HashMap<String, AssociationCache>,
}

impl Debug for ViewModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewModel")
            .field("reference", &self.reference())
            .field("persisted", &self.persisted)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl ViewModel {
    /// A viewmodel over a record that does not exist in the store yet.
    pub fn new_record(descriptor: Arc<ViewDescriptor>) -> Self {
        let record = RecordData::new(descriptor.record_type());
        ViewModel {
            descriptor,
            record,
            persisted: false,
            dirty: BTreeSet::new(),
            associations: HashMap::new(),
        }
    }

    /// A viewmodel over a row loaded from the store.
    pub fn from_record(descriptor: Arc<ViewDescriptor>, record: RecordData) -> Self {
        debug_assert_eq!(record.table, descriptor.record_type());
        ViewModel {
            descriptor,
            record,
            persisted: true,
            dirty: BTreeSet::new(),
            associations: HashMap::new(),
        }
    }

    pub fn descriptor(&self) -> &Arc<ViewDescriptor> {
        &self.descriptor
    }

    pub fn reference(&self) -> Reference {
        Reference::new(self.descriptor.name().clone(), self.record.id.clone())
    }

    pub fn id(&self) -> Option<&RecordId> {
        self.record.id.as_ref()
    }

    pub fn table(&self) -> &str {
        &self.record.table
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn is_new(&self) -> bool {
        !self.persisted
    }

    pub fn attribute(&self, column: &str) -> Option<&Value> {
        self.record.get(column)
    }

    /// Writes a column, marking it dirty only when the value changes. An
    /// absent column and an explicit null compare equal.
    pub fn write_attribute(&mut self, column: &str, value: Value) {
        let current = self.record.get(column);
        if current == Some(&value) || (current.is_none() && value.is_null()) {
            return;
        }
        self.record.set(column.to_owned(), value);
        self.dirty.insert(column.to_owned());
    }

    /// Chosen primary key for a new record. The planner uses this to carry a
    /// client-supplied identity into the insert.
    pub fn choose_id(&mut self, id: RecordId) {
        debug_assert!(!self.persisted);
        self.record.id = Some(id);
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_columns(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    /// Column values to be written by the next save, in declaration order.
    pub fn dirty_values(&self) -> indexmap::IndexMap<String, Value> {
        self.record
            .values
            .iter()
            .filter(|(column, _)| self.dirty.contains(*column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }

    /// All column values, for the initial insert.
    pub fn all_values(&self) -> &indexmap::IndexMap<String, Value> {
        &self.record.values
    }

    /// Current value of the optimistic-lock column, if the view declares one.
    pub fn lock_value(&self) -> Option<i64> {
        let column = self.descriptor.lock_attribute()?;
        Some(self.record.get_i64(column).unwrap_or(0))
    }

    /// Marks the viewmodel saved: the record now exists under `id` and no
    /// columns are dirty.
    pub fn mark_saved(&mut self, id: RecordId) {
        self.record.id = Some(id);
        self.persisted = true;
        self.dirty.clear();
    }

    /// Bumps the cached lock column after a successful locked update.
    pub fn bump_lock(&mut self) {
        if let Some(column) = self.descriptor.lock_attribute() {
            let next = self.record.get_i64(column).unwrap_or(0) + 1;
            self.record.set(column.to_owned(), Value::from(next));
        }
    }

    pub fn association(&self, name: &str) -> Option<&AssociationCache> {
        self.associations.get(name)
    }

    pub fn set_association(&mut self, name: impl Into<String>, cache: AssociationCache) {
        self.associations.insert(name.into(), cache);
    }

    pub fn record(&self) -> &RecordData {
        &self.record
    }
}
