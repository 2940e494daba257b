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

//! The view registry.
//!
//! Maps view names to descriptors. Populated once at process start and
//! read-only afterwards; the engine shares it behind an `Arc`.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::descriptor::ViewDescriptor;
use crate::reference::ViewName;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown view {0}")]
    UnknownView(ViewName),
    #[error("view {0} is already registered")]
    DuplicateView(ViewName),
}

#[derive(Default)]
pub struct ViewRegistry {
    views: IndexMap<ViewName, Arc<ViewDescriptor>>,
}

impl Debug for ViewRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewRegistry")
            .field("views", &self.views.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ViewRegistry {
    pub fn new() -> Self {
        ViewRegistry::default()
    }

    pub fn register(&mut self, descriptor: Arc<ViewDescriptor>) -> Result<(), RegistryError> {
        let name = descriptor.name().clone();
        if self.views.contains_key(&name) {
            return Err(RegistryError::DuplicateView(name));
        }
        self.views.insert(name, descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &ViewName) -> Result<&Arc<ViewDescriptor>, RegistryError> {
        self.views
            .get(name)
            .ok_or_else(|| RegistryError::UnknownView(name.clone()))
    }

    pub fn get(&self, name: &ViewName) -> Option<&Arc<ViewDescriptor>> {
        self.views.get(name)
    }

    /// Descriptors marked as independently addressable roots, in
    /// registration order.
    pub fn roots(&self) -> impl Iterator<Item = &Arc<ViewDescriptor>> {
        self.views.values().filter(|d| d.is_root())
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<ViewDescriptor>> {
        self.views.values()
    }

    /// Tears down a transient descriptor. Production code never removes;
    /// this exists for tests that build throwaway view types.
    #[cfg(any(test, feature = "testing"))]
    pub fn remove(&mut self, name: &ViewName) -> Option<Arc<ViewDescriptor>> {
        self.views.shift_remove(name)
    }
}
