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

//! Node addresses: view names, side-table keys, and record references.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::record::RecordId;

/// Stable textual identifier of a view type. Distinct from the underlying
/// record type name.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewName(String);

impl ViewName {
    pub fn new(name: impl Into<String>) -> Self {
        ViewName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for ViewName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ViewName").field(&self.0).finish()
    }
}

impl fmt::Display for ViewName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ViewName {
    fn from(name: &str) -> Self {
        ViewName::new(name)
    }
}

/// Opaque key into the references side-table.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceKey(String);

impl ReferenceKey {
    pub fn new(key: impl Into<String>) -> Self {
        ReferenceKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for ReferenceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReferenceKey").field(&self.0).finish()
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReferenceKey {
    fn from(key: &str) -> Self {
        ReferenceKey::new(key)
    }
}

/// Canonical address of one view node: the view type plus the record
/// identity, or no identity for a record that has not been persisted yet.
///
/// Used as the key of the release pool, the planner's duplicate check, and
/// the access-control root cache.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct Reference {
    pub view: ViewName,
    pub id: Option<RecordId>,
}

impl Reference {
    pub fn new(view: ViewName, id: Option<RecordId>) -> Self {
        Reference { view, id }
    }

    pub fn persisted(view: ViewName, id: RecordId) -> Self {
        Reference { view, id: Some(id) }
    }
}

impl Debug for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({self})")
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}({})", self.view, id),
            None => write!(f, "{}(new)", self.view),
        }
    }
}
