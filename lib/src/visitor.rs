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

//! Traversal hooks.
//!
//! Descriptors register callbacks on named hook points. The executor pushes
//! a context frame per node and invokes the callbacks of each point in
//! declaration order, view-mutating callbacks before observing ones.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::change::ChangeSummary;
use crate::reference::Reference;
use crate::viewmodel::ViewModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    PreVisit,
    BeforeDeserialize,
    BeforeValidate,
    OnChange,
    AfterDeserialize,
    AfterVisit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// May rewrite the viewmodel; runs before observing callbacks.
    Mutating,
    Observing,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("callback {callback} failed: {message}")]
pub struct CallbackError {
    pub callback: String,
    pub message: String,
}

pub struct HookContext<'a> {
    pub view: &'a mut ViewModel,
    pub change: Option<&'a ChangeSummary>,
    pub params: &'a Value,
}

pub type HookFn = Arc<dyn Fn(&mut HookContext<'_>) -> Result<(), CallbackError> + Send + Sync>;

#[derive(Clone)]
pub struct Callback {
    name: String,
    point: HookPoint,
    kind: CallbackKind,
    run: HookFn,
}

impl Debug for Callback {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("point", &self.point)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Callback {
    pub fn mutating(
        name: impl Into<String>,
        point: HookPoint,
        run: impl Fn(&mut HookContext<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    ) -> Self {
        Callback {
            name: name.into(),
            point,
            kind: CallbackKind::Mutating,
            run: Arc::new(run),
        }
    }

    pub fn observing(
        name: impl Into<String>,
        point: HookPoint,
        run: impl Fn(&mut HookContext<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    ) -> Self {
        Callback {
            name: name.into(),
            point,
            kind: CallbackKind::Observing,
            run: Arc::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn point(&self) -> HookPoint {
        self.point
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }
}

/// Runs the callbacks registered for `point`: mutating ones first, each
/// partition in declaration order.
pub fn invoke(
    callbacks: &[Callback],
    point: HookPoint,
    ctx: &mut HookContext<'_>,
) -> Result<(), CallbackError> {
    for kind in [CallbackKind::Mutating, CallbackKind::Observing] {
        for callback in callbacks {
            if callback.point == point && callback.kind == kind {
                (callback.run)(ctx)?;
            }
        }
    }
    Ok(())
}

/// Stack of node addresses for the subtree currently being visited. Errors
/// blame the whole chain from the root down.
#[derive(Debug, Default)]
pub struct TraversalFrames {
    frames: Vec<Reference>,
}

impl TraversalFrames {
    pub fn new() -> Self {
        TraversalFrames::default()
    }

    pub fn push(&mut self, node: Reference) {
        self.frames.push(node);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn current_root(&self) -> Option<&Reference> {
        self.frames.first()
    }

    pub fn path(&self) -> &[Reference] {
        &self.frames
    }
}
