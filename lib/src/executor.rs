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

//! The executor.
//!
//! Walks the planned operation DAG depth-first inside one store
//! transaction. Local-pointer children run before their owner's save so
//! the owner can take their record ids; remote-pointer children run after,
//! rewriting their own foreign keys. Low-level save failures are
//! translated into the request-level error kinds, and the dependent
//! effects of unclaimed releases run once the whole DAG has executed.

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::access::AccessError;
use crate::access::AccessTree;
use crate::change::ChangeSummary;
use crate::change::ChangeTracker;
use crate::descriptor::DependentPolicy;
use crate::plan::AssociationOps;
use crate::plan::OpId;
use crate::plan::RunState;
use crate::plan::UpdatePlan;
use crate::record::RecordId;
use crate::reference::Reference;
use crate::release_pool::ReleasePool;
use crate::store::StoreError;
use crate::store::StoreTransaction;
use crate::viewmodel::AssociationCache;
use crate::viewmodel::ViewModel;
use crate::visitor;
use crate::visitor::CallbackError;
use crate::visitor::HookContext;
use crate::visitor::HookPoint;
use crate::visitor::TraversalFrames;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error("validation failed for {node}")]
    Validation {
        node: Reference,
        errors: Vec<(String, String)>,
    },
    #[error("optimistic lock failed for {node}")]
    LockFailure { node: Reference },
    #[error("{node} could not be saved: {message}")]
    Save { node: Reference, message: String },
    #[error("operation cycle through {node}")]
    Cycle { node: Reference },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a successful walk leaves behind: the root viewmodels with their
/// association caches rewritten, and the per-node change summaries.
pub struct ExecuteOutcome {
    pub roots: Vec<ViewModel>,
    pub changes: ChangeTracker,
}

pub struct Executor<'a, 't> {
    txn: &'t mut dyn StoreTransaction,
    access: AccessTree<'a>,
    params: &'a Value,
    tracker: ChangeTracker,
    frames: TraversalFrames,
}

impl<'a, 't> Executor<'a, 't> {
    pub fn new(txn: &'t mut dyn StoreTransaction, params: &'a Value) -> Self {
        Executor {
            txn,
            access: AccessTree::new(params),
            params,
            tracker: ChangeTracker::new(),
            frames: TraversalFrames::new(),
        }
    }

    /// Runs every root operation, then the deferred effects of unclaimed
    /// releases. The caller owns the transaction and commits after.
    pub fn execute(
        mut self,
        plan: &mut UpdatePlan,
        pool: &mut ReleasePool,
    ) -> Result<ExecuteOutcome, ExecuteError> {
        for root in plan.roots().to_vec() {
            let root_reference = plan.op(root).viewmodel.reference();
            self.access.enter_root(&plan.op(root).viewmodel);
            let result = self.run_op(plan, root);
            if result.is_ok() {
                self.invoke_hooks(plan, root, HookPoint::AfterVisit, None)?;
            }
            self.access.exit_root(&root_reference);
            result?;
        }
        self.apply_releases(pool)?;

        let roots = plan
            .roots()
            .iter()
            .map(|root| plan.op(*root).viewmodel.clone())
            .collect();
        Ok(ExecuteOutcome {
            roots,
            changes: self.tracker,
        })
    }

    /// Executes one operation; returns whether anything in its subtree
    /// changed.
    fn run_op(&mut self, plan: &mut UpdatePlan, op: OpId) -> Result<bool, ExecuteError> {
        match plan.op(op).run_state {
            RunState::Run => return Ok(false),
            RunState::Running => {
                return Err(ExecuteError::Cycle {
                    node: plan.op(op).viewmodel.reference(),
                })
            }
            RunState::Pending => {}
        }
        plan.op_mut(op).run_state = RunState::Running;
        let pre_save_reference = plan.op(op).viewmodel.reference();
        self.frames.push(pre_save_reference.clone());

        let root = self.frames.current_root().cloned();
        self.access
            .check_visible(&plan.op(op).viewmodel, root.as_ref())?;
        self.invoke_hooks(plan, op, HookPoint::PreVisit, None)?;

        if let Some(link) = plan.op(op).reparent_to.clone() {
            // Remote-pointer children run inside their owner's walk, after
            // its save. Reaching one before its owner has a record id means
            // the pointer structure cannot be ordered.
            let Some(parent_id) = plan.op(link.parent).viewmodel.id().cloned() else {
                return Err(ExecuteError::Cycle {
                    node: pre_save_reference.clone(),
                });
            };
            plan.op_mut(op)
                .viewmodel
                .write_attribute(&link.key_column, parent_id.to_value());
        }
        if let Some(position) = plan.op(op).reposition_to {
            let column = plan
                .op(op)
                .viewmodel
                .descriptor()
                .list_attribute()
                .expect("repositioned elements have a list attribute")
                .to_owned();
            plan.op_mut(op)
                .viewmodel
                .write_attribute(&column, Value::from(position));
        }

        self.invoke_hooks(plan, op, HookPoint::BeforeDeserialize, None)?;
        let writes = plan.op(op).attributes.clone();
        for (column, value) in writes {
            plan.op_mut(op).viewmodel.write_attribute(&column, value);
        }

        // Local-pointer children reach Run before this node's save, and
        // their ids land in this node's foreign-key columns.
        let mut subtree_changed = false;
        for local in plan.op(op).points_to.clone() {
            subtree_changed |= self.run_op(plan, local.child)?;
            let child_id = plan
                .op(local.child)
                .viewmodel
                .id()
                .cloned()
                .expect("local-pointer children are saved");
            let child_view = plan
                .op(local.child)
                .viewmodel
                .descriptor()
                .name()
                .as_str()
                .to_owned();
            let viewmodel = &mut plan.op_mut(op).viewmodel;
            viewmodel.write_attribute(&local.key_column, child_id.to_value());
            if let Some(column) = &local.discriminator {
                viewmodel.write_attribute(column, Value::from(child_view));
            }
        }

        self.invoke_hooks(plan, op, HookPoint::BeforeValidate, None)?;

        let changed = plan.op(op).viewmodel.is_dirty() || plan.op(op).association_changed;
        let summary = self.summary_of(plan, op);
        if changed {
            self.access
                .check_editable(&plan.op(op).viewmodel, root.as_ref())?;
            self.invoke_hooks(plan, op, HookPoint::OnChange, Some(&summary))?;
            self.access
                .check_valid_edit(&plan.op(op).viewmodel, &summary)?;
        }

        self.save(plan, op)?;
        self.invoke_hooks(plan, op, HookPoint::AfterDeserialize, None)?;

        for child in plan.op(op).pointed_to.clone() {
            subtree_changed |= self.run_op(plan, child)?;
        }

        self.rewrite_association_caches(plan, op);

        let mut summary = summary;
        summary.changed_children = subtree_changed;
        let node_changed = changed || summary.new;
        subtree_changed |= node_changed;
        self.tracker
            .record(plan.op(op).viewmodel.reference(), summary);

        self.frames.pop();
        plan.op_mut(op).run_state = RunState::Run;
        Ok(subtree_changed)
    }

    fn summary_of(&self, plan: &UpdatePlan, op: OpId) -> ChangeSummary {
        let operation = plan.op(op);
        ChangeSummary {
            new: operation.viewmodel.is_new(),
            deleted: false,
            changed_attributes: operation.viewmodel.dirty_columns().clone(),
            changed_associations: operation
                .changed_associations
                .iter()
                .cloned()
                .collect(),
            changed_children: false,
        }
    }

    fn invoke_hooks(
        &mut self,
        plan: &mut UpdatePlan,
        op: OpId,
        point: HookPoint,
        change: Option<&ChangeSummary>,
    ) -> Result<(), ExecuteError> {
        let operation = plan.op_mut(op);
        let callbacks = operation.viewmodel.descriptor().callbacks().to_vec();
        if callbacks.is_empty() {
            return Ok(());
        }
        let mut ctx = HookContext {
            view: &mut operation.viewmodel,
            change,
            params: self.params,
        };
        visitor::invoke(&callbacks, point, &mut ctx)?;
        Ok(())
    }

    /// Saves the node, translating driver failures into request errors.
    fn save(&mut self, plan: &mut UpdatePlan, op: OpId) -> Result<(), ExecuteError> {
        let node = plan.op(op).viewmodel.reference();
        if plan.op(op).viewmodel.is_new() {
            let (table, values, chosen) = {
                let viewmodel = &plan.op(op).viewmodel;
                (
                    viewmodel.table().to_owned(),
                    viewmodel.all_values().clone(),
                    viewmodel.id().cloned(),
                )
            };
            let mut values = values;
            if let Some(id) = chosen {
                values.insert("id".to_owned(), id.to_value());
            }
            let id = self
                .txn
                .insert(&table, &values)
                .map_err(|err| translate_save_error(err, &node))?;
            debug!(node = %plan.op(op).viewmodel.reference(), %id, "inserted");
            plan.op_mut(op).viewmodel.mark_saved(id);
            return Ok(());
        }
        if !plan.op(op).viewmodel.is_dirty() {
            return Ok(());
        }
        let (table, id, mut writes, lock) = {
            let viewmodel = &plan.op(op).viewmodel;
            let lock = viewmodel
                .descriptor()
                .lock_attribute()
                .map(|column| (column.to_owned(), viewmodel.lock_value().unwrap_or(0)));
            (
                viewmodel.table().to_owned(),
                viewmodel.id().cloned().expect("persisted records have ids"),
                viewmodel.dirty_values(),
                lock,
            )
        };
        // The version column is asserted, not written; the store bumps it.
        if let Some((lock_column, _)) = &lock {
            writes.shift_remove(lock_column);
        }
        self.txn
            .update(
                &table,
                &id,
                &writes,
                lock.as_ref().map(|(column, expected)| (column.as_str(), *expected)),
            )
            .map_err(|err| translate_save_error(err, &node))?;
        debug!(node = %node, "updated");
        let viewmodel = &mut plan.op_mut(op).viewmodel;
        if lock.is_some() {
            viewmodel.bump_lock();
        }
        viewmodel.mark_saved(id);
        Ok(())
    }

    /// Rewrites this record's association caches to the resulting child
    /// records, so subsequent reads see the new state without reloading.
    fn rewrite_association_caches(&mut self, plan: &mut UpdatePlan, op: OpId) {
        for (name, ops) in plan.op(op).association_rewrites.clone() {
            let cache = match ops {
                AssociationOps::One(child) => AssociationCache::One(
                    child.map(|child| Box::new(plan.op(child).viewmodel.clone())),
                ),
                AssociationOps::Many(children) => AssociationCache::Many(
                    children
                        .iter()
                        .map(|child| plan.op(*child).viewmodel.clone())
                        .collect(),
                ),
            };
            plan.op_mut(op).viewmodel.set_association(name, cache);
        }
    }

    /// Dependent effects for releases nobody claimed. Runs inside the
    /// transaction, after the whole DAG; rollback therefore covers it.
    fn apply_releases(&mut self, pool: &mut ReleasePool) -> Result<(), ExecuteError> {
        let unclaimed: Vec<_> = pool.drain_unclaimed().collect();
        for entry in unclaimed {
            let Some(id) = entry.viewmodel.id().cloned() else {
                continue;
            };
            let reference = entry.viewmodel.reference();
            let table = entry.viewmodel.table().to_owned();
            match entry.dependent {
                None => {}
                Some(DependentPolicy::Detach) => {
                    debug!(node = %reference, "detached");
                    let mut writes = IndexMap::new();
                    writes.insert(entry.key_column.clone(), Value::Null);
                    self.txn.update(&table, &id, &writes, None)?;
                    self.tracker.record(
                        reference,
                        ChangeSummary {
                            changed_attributes: [entry.key_column.clone()].into(),
                            ..Default::default()
                        },
                    );
                }
                Some(DependentPolicy::Delete) => {
                    debug!(node = %reference, "deleted");
                    self.delete_row(&table, &id)?;
                    self.tracker.record(
                        reference,
                        ChangeSummary {
                            deleted: true,
                            ..Default::default()
                        },
                    );
                }
                Some(DependentPolicy::Destroy) => {
                    debug!(node = %reference, "destroyed");
                    let mut viewmodel = entry.viewmodel.clone();
                    let summary = ChangeSummary {
                        deleted: true,
                        ..Default::default()
                    };
                    let callbacks = viewmodel.descriptor().callbacks().to_vec();
                    let mut ctx = HookContext {
                        view: &mut viewmodel,
                        change: Some(&summary),
                        params: self.params,
                    };
                    visitor::invoke(&callbacks, HookPoint::AfterVisit, &mut ctx)?;
                    self.delete_row(&table, &id)?;
                    self.tracker.record(reference, summary);
                }
            }
        }
        Ok(())
    }

    fn delete_row(&mut self, table: &str, id: &RecordId) -> Result<(), ExecuteError> {
        match self.txn.delete(table, id) {
            // Already gone; the release outcome holds either way.
            Err(StoreError::NotFound { .. }) | Ok(()) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn translate_save_error(err: StoreError, node: &Reference) -> ExecuteError {
    match err {
        StoreError::RowValidation { errors, .. } => ExecuteError::Validation {
            node: node.clone(),
            errors,
        },
        StoreError::StaleRecord { .. } => ExecuteError::LockFailure { node: node.clone() },
        StoreError::ForeignKeyViolation { message, .. } => ExecuteError::Save {
            node: node.clone(),
            message,
        },
        other => ExecuteError::Save {
            node: node.clone(),
            message: other.to_string(),
        },
    }
}
