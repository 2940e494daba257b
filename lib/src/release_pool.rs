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

//! The release pool.
//!
//! When an owner stops referencing a child during a request, the child is
//! parked here instead of being destroyed. Another owner in the same
//! request can claim it, which transfers ownership and cancels the pending
//! destruction. Claiming is destructive, so a key can be claimed at most
//! once. Entries still present when the request's operations have all run
//! are subject to their association's dependent policy.

use indexmap::IndexMap;

use crate::descriptor::DependentPolicy;
use crate::reference::Reference;
use crate::viewmodel::ViewModel;

/// One released child, with enough of its former association to apply the
/// dependent policy if nobody claims it.
#[derive(Debug, Clone)]
pub struct ReleaseEntry {
    pub viewmodel: ViewModel,
    /// Owner that let go of the record, for blame output.
    pub owner: Reference,
    pub association: String,
    pub dependent: Option<DependentPolicy>,
    /// Inverse foreign-key column to clear when detaching.
    pub key_column: String,
}

#[derive(Debug, Default)]
pub struct ReleasePool {
    entries: IndexMap<Reference, ReleaseEntry>,
}

impl ReleasePool {
    pub fn new() -> Self {
        ReleasePool::default()
    }

    pub fn release(&mut self, entry: ReleaseEntry) {
        let reference = entry.viewmodel.reference();
        debug_assert!(
            !self.entries.contains_key(&reference),
            "{reference} released twice"
        );
        self.entries.insert(reference, entry);
    }

    /// Removes and returns the entry, transferring ownership to the caller.
    pub fn try_claim(&mut self, reference: &Reference) -> Option<ReleaseEntry> {
        self.entries.shift_remove(reference)
    }

    pub fn contains(&self, reference: &Reference) -> bool {
        self.entries.contains_key(reference)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries nobody claimed, in release order.
    pub fn drain_unclaimed(&mut self) -> impl Iterator<Item = ReleaseEntry> + '_ {
        self.entries.drain(..).map(|(_, entry)| entry)
    }
}
