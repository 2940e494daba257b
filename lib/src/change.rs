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

//! Per-node change summaries collected during a write.
//!
//! Summaries feed the `valid_edit` access checks and the visitor callbacks,
//! and are returned to the caller so a response can report what actually
//! changed. Attribute and association sets compare order-insensitively.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::reference::Reference;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub new: bool,
    pub deleted: bool,
    pub changed_attributes: BTreeSet<String>,
    pub changed_associations: BTreeSet<String>,
    /// Whether any node below this one changed.
    pub changed_children: bool,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        !self.new
            && !self.deleted
            && !self.changed_children
            && self.changed_attributes.is_empty()
            && self.changed_associations.is_empty()
    }
}

/// Request-scoped registry of change summaries, keyed by node address in the
/// order nodes finished executing.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    changes: IndexMap<Reference, ChangeSummary>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        ChangeTracker::default()
    }

    pub fn record(&mut self, reference: Reference, summary: ChangeSummary) {
        match self.changes.entry(reference) {
            indexmap::map::Entry::Occupied(mut entry) => {
                let merged = entry.get_mut();
                merged.new |= summary.new;
                merged.deleted |= summary.deleted;
                merged.changed_children |= summary.changed_children;
                merged.changed_attributes.extend(summary.changed_attributes);
                merged
                    .changed_associations
                    .extend(summary.changed_associations);
            }
            indexmap::map::Entry::Vacant(entry) => {
                entry.insert(summary);
            }
        }
    }

    pub fn get(&self, reference: &Reference) -> Option<&ChangeSummary> {
        self.changes.get(reference)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Reference, &ChangeSummary)> {
        self.changes.iter()
    }

    pub fn into_changes(self) -> IndexMap<Reference, ChangeSummary> {
        self.changes
    }
}
