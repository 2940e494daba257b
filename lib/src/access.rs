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

//! Per-view access control.
//!
//! A policy carries up to three check sets (`visible`, `editable`,
//! `valid_edit`). Each check is a PERMIT or DENY with `when`/`unless`
//! predicates; a check fires when any `when` predicate holds (or none are
//! declared) and no `unless` predicate holds. A fired DENY always wins over
//! fired PERMITs.
//!
//! Root-scoped policies additionally declare checks for every node under a
//! root. Those are evaluated once per root visit, cached by the root's
//! address, merged into each descendant's local result, and dropped when
//! the root's subtree has been fully visited.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::change::ChangeSummary;
use crate::reference::Reference;
use crate::reference::ViewName;
use crate::viewmodel::ViewModel;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("{node} is not visible: {reason}")]
    Visibility { node: Reference, reason: String },
    #[error("{node} is not editable: {reason}")]
    Editability { node: Reference, reason: String },
    #[error("edit of {node} rejected: {reason}")]
    InvalidEdit { node: Reference, reason: String },
    #[error("root-scoped policy of {view} evaluated outside a root context")]
    OutsideRootContext { view: ViewName },
}

/// Everything a predicate may look at.
pub struct PolicyContext<'a> {
    pub view: &'a ViewModel,
    pub change: Option<&'a ChangeSummary>,
    /// Request-scoped caller data (e.g. the acting user), opaque to the
    /// engine.
    pub params: &'a Value,
}

pub type PredicateFn = Arc<dyn Fn(&PolicyContext<'_>) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Permit,
    Deny,
}

#[derive(Clone)]
pub struct Check {
    verdict: Verdict,
    reason: String,
    when: Vec<PredicateFn>,
    unless: Vec<PredicateFn>,
}

impl Debug for Check {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check")
            .field("verdict", &self.verdict)
            .field("reason", &self.reason)
            .finish()
    }
}

impl Check {
    pub fn permit(reason: impl Into<String>) -> Self {
        Check {
            verdict: Verdict::Permit,
            reason: reason.into(),
            when: vec![],
            unless: vec![],
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Check {
            verdict: Verdict::Deny,
            reason: reason.into(),
            when: vec![],
            unless: vec![],
        }
    }

    pub fn when(mut self, f: impl Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static) -> Self {
        self.when.push(Arc::new(f));
        self
    }

    pub fn unless(
        mut self,
        f: impl Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.unless.push(Arc::new(f));
        self
    }

    fn fires(&self, ctx: &PolicyContext<'_>) -> bool {
        let any_when = self.when.is_empty() || self.when.iter().any(|f| f(ctx));
        let any_unless = self.unless.iter().any(|f| f(ctx));
        any_when && !any_unless
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckSet {
    checks: Vec<Check>,
}

impl CheckSet {
    pub fn push(&mut self, check: Check) {
        self.checks.push(check);
    }

    pub fn extend_from(&mut self, other: &CheckSet) {
        self.checks.extend(other.checks.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// A set with no checks permits everything; a set with permit checks
    /// requires at least one of them to fire; a fired deny always wins.
    pub fn evaluate(&self, ctx: &PolicyContext<'_>) -> AccessResult {
        let mut permitted = !self.checks.iter().any(|c| c.verdict == Verdict::Permit);
        for check in &self.checks {
            if !check.fires(ctx) {
                continue;
            }
            match check.verdict {
                Verdict::Deny => return AccessResult::denied(check.reason.clone()),
                Verdict::Permit => permitted = true,
            }
        }
        if permitted {
            AccessResult::Permitted
        } else {
            AccessResult::denied("no permitting check applied")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessResult {
    Permitted,
    Denied { reason: String },
}

impl AccessResult {
    pub fn denied(reason: impl Into<String>) -> Self {
        AccessResult::Denied {
            reason: reason.into(),
        }
    }

    pub fn is_permitted(&self) -> bool {
        matches!(self, AccessResult::Permitted)
    }

    /// Deny wins; the earlier denial keeps its reason.
    pub fn merge(self, other: AccessResult) -> AccessResult {
        match self {
            AccessResult::Permitted => other,
            denied @ AccessResult::Denied { .. } => denied,
        }
    }
}

/// Checks evaluated once per root and cascaded to every descendant.
#[derive(Debug, Clone, Default)]
pub struct RootScope {
    pub children_visible: CheckSet,
    pub children_editable: CheckSet,
}

#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub visible: CheckSet,
    pub editable: CheckSet,
    pub valid_edit: CheckSet,
    pub root_scope: Option<RootScope>,
}

impl Policy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    /// Copies another policy's checks into this one, preserving order.
    pub fn include(&mut self, other: &Policy) {
        self.visible.extend_from(&other.visible);
        self.editable.extend_from(&other.editable);
        self.valid_edit.extend_from(&other.valid_edit);
        if let Some(other_scope) = &other.root_scope {
            let scope = self.root_scope.get_or_insert_with(RootScope::default);
            scope.children_visible.extend_from(&other_scope.children_visible);
            scope
                .children_editable
                .extend_from(&other_scope.children_editable);
        }
    }
}

#[derive(Debug, Default)]
pub struct PolicyBuilder {
    policy: Policy,
}

impl PolicyBuilder {
    pub fn visible(mut self, check: Check) -> Self {
        self.policy.visible.push(check);
        self
    }

    pub fn editable(mut self, check: Check) -> Self {
        self.policy.editable.push(check);
        self
    }

    pub fn valid_edit(mut self, check: Check) -> Self {
        self.policy.valid_edit.push(check);
        self
    }

    pub fn root_children_visible(mut self, check: Check) -> Self {
        self.policy
            .root_scope
            .get_or_insert_with(RootScope::default)
            .children_visible
            .push(check);
        self
    }

    pub fn root_children_editable(mut self, check: Check) -> Self {
        self.policy
            .root_scope
            .get_or_insert_with(RootScope::default)
            .children_editable
            .push(check);
        self
    }

    pub fn build(self) -> Policy {
        self.policy
    }
}

#[derive(Debug, Clone)]
struct RootResult {
    children_visible: AccessResult,
    children_editable: AccessResult,
}

/// Per-request policy evaluator. Holds the cached root pre-check results;
/// the cache entry for a root lives exactly from `enter_root` to
/// `exit_root`.
pub struct AccessTree<'a> {
    params: &'a Value,
    root_results: HashMap<Reference, RootResult>,
}

impl<'a> AccessTree<'a> {
    pub fn new(params: &'a Value) -> Self {
        AccessTree {
            params,
            root_results: HashMap::new(),
        }
    }

    pub fn context<'b>(
        &self,
        view: &'b ViewModel,
        change: Option<&'b ChangeSummary>,
    ) -> PolicyContext<'b>
    where
        'a: 'b,
    {
        PolicyContext {
            view,
            change,
            params: self.params,
        }
    }

    /// First visit of a root: evaluates its root-scoped pre-checks and
    /// caches the result under the root's address.
    pub fn enter_root(&mut self, root: &ViewModel) {
        let Some(scope) = &root.descriptor().policy().root_scope else {
            return;
        };
        let ctx = self.context(root, None);
        let result = RootResult {
            children_visible: scope.children_visible.evaluate(&ctx),
            children_editable: scope.children_editable.evaluate(&ctx),
        };
        self.root_results.insert(root.reference(), result);
    }

    /// `after_visit` of a root: drops the cached pre-check result.
    pub fn exit_root(&mut self, root: &Reference) {
        self.root_results.remove(root);
    }

    fn root_result(
        &self,
        view: &ViewModel,
        root: Option<&Reference>,
    ) -> Result<Option<&RootResult>, AccessError> {
        let policy = view.descriptor().policy();
        match root.and_then(|r| self.root_results.get(r)) {
            Some(result) => Ok(Some(result)),
            None if policy.root_scope.is_some() => Err(AccessError::OutsideRootContext {
                view: view.descriptor().name().clone(),
            }),
            None => Ok(None),
        }
    }

    pub fn check_visible(
        &self,
        view: &ViewModel,
        root: Option<&Reference>,
    ) -> Result<(), AccessError> {
        let inherited = match self.root_result(view, root)? {
            Some(result) => result.children_visible.clone(),
            None => AccessResult::Permitted,
        };
        let ctx = self.context(view, None);
        let local = view.descriptor().policy().visible.evaluate(&ctx);
        match inherited.merge(local) {
            AccessResult::Permitted => Ok(()),
            AccessResult::Denied { reason } => Err(AccessError::Visibility {
                node: view.reference(),
                reason,
            }),
        }
    }

    pub fn check_editable(
        &self,
        view: &ViewModel,
        root: Option<&Reference>,
    ) -> Result<(), AccessError> {
        let inherited = match self.root_result(view, root)? {
            Some(result) => result.children_editable.clone(),
            None => AccessResult::Permitted,
        };
        let ctx = self.context(view, None);
        let local = view.descriptor().policy().editable.evaluate(&ctx);
        match inherited.merge(local) {
            AccessResult::Permitted => Ok(()),
            AccessResult::Denied { reason } => Err(AccessError::Editability {
                node: view.reference(),
                reason,
            }),
        }
    }

    /// Runs only when the executor observed actual changes on the node.
    pub fn check_valid_edit(
        &self,
        view: &ViewModel,
        change: &ChangeSummary,
    ) -> Result<(), AccessError> {
        let ctx = self.context(view, Some(change));
        match view.descriptor().policy().valid_edit.evaluate(&ctx) {
            AccessResult::Permitted => Ok(()),
            AccessResult::Denied { reason } => Err(AccessError::InvalidEdit {
                node: view.reference(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx_with<'a>(view: &'a ViewModel, params: &'a Value) -> PolicyContext<'a> {
        PolicyContext {
            view,
            change: None,
            params,
        }
    }

    fn any_view() -> ViewModel {
        let descriptor = crate::descriptor::ViewDescriptor::builder("Thing")
            .build()
            .unwrap();
        ViewModel::new_record(descriptor)
    }

    #[test]
    fn test_empty_check_set_permits() {
        let set = CheckSet::default();
        let view = any_view();
        let params = json!({});
        assert!(set.evaluate(&ctx_with(&view, &params)).is_permitted());
    }

    #[test]
    fn test_unfired_permit_denies() {
        let mut set = CheckSet::default();
        set.push(Check::permit("admin only").when(|ctx| ctx.params["admin"] == json!(true)));
        let view = any_view();

        let admin = json!({"admin": true});
        assert!(set.evaluate(&ctx_with(&view, &admin)).is_permitted());

        let guest = json!({"admin": false});
        assert!(!set.evaluate(&ctx_with(&view, &guest)).is_permitted());
    }

    #[test]
    fn test_deny_wins_over_permit() {
        let mut set = CheckSet::default();
        set.push(Check::permit("anyone"));
        set.push(Check::deny("frozen").when(|ctx| ctx.params["frozen"] == json!(true)));
        let view = any_view();

        let frozen = json!({"frozen": true});
        assert_eq!(
            set.evaluate(&ctx_with(&view, &frozen)),
            AccessResult::denied("frozen")
        );
    }

    #[test]
    fn test_unless_suppresses_check() {
        let mut set = CheckSet::default();
        set.push(Check::deny("locked").unless(|ctx| ctx.params["override"] == json!(true)));
        let view = any_view();

        let plain = json!({});
        assert!(!set.evaluate(&ctx_with(&view, &plain)).is_permitted());
        let overridden = json!({"override": true});
        assert!(set.evaluate(&ctx_with(&view, &overridden)).is_permitted());
    }

    #[test]
    fn test_root_scope_cascades_and_clears() {
        let descriptor = crate::descriptor::ViewDescriptor::builder("Doc")
            .root()
            .policy(
                Policy::builder()
                    .root_children_editable(
                        Check::deny("read-only share").when(|ctx| ctx.params["ro"] == json!(true)),
                    )
                    .build(),
            )
            .build()
            .unwrap();
        let root = ViewModel::new_record(descriptor);

        let params = json!({"ro": true});
        let mut tree = AccessTree::new(&params);
        tree.enter_root(&root);
        let err = tree
            .check_editable(&root, Some(&root.reference()))
            .unwrap_err();
        assert!(matches!(err, AccessError::Editability { .. }));

        tree.exit_root(&root.reference());
        // Cache cleared: a later visit outside a root context is structural.
        let err = tree.check_editable(&root, None).unwrap_err();
        assert!(matches!(err, AccessError::OutsideRootContext { .. }));
    }
}
