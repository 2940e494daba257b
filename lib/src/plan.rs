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

//! The update planner.
//!
//! Consumes normalized [`UpdateData`] trees and produces the operation DAG
//! the executor walks. Planning resolves every node to a viewmodel (fresh
//! record, reuse of a current child, claim from the release pool, or a
//! store load), applies functional collection edits over the current
//! children, assigns list positions, releases discarded children, and
//! splits parent/child links by pointer direction so the executor can save
//! in foreign-key order.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools as _;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::descriptor::AssociationDescriptor;
use crate::descriptor::Cardinality;
use crate::descriptor::DependentPolicy;
use crate::descriptor::PointerLocation;
use crate::descriptor::ThroughSpec;
use crate::descriptor::ViewDescriptor;
use crate::positions::interleaved_positions;
use crate::record::RecordData;
use crate::record::RecordId;
use crate::reference::Reference;
use crate::reference::ReferenceKey;
use crate::reference::ViewName;
use crate::registry::RegistryError;
use crate::registry::ViewRegistry;
use crate::release_pool::ReleaseEntry;
use crate::release_pool::ReleasePool;
use crate::store::StoreError;
use crate::store::StoreTransaction;
use crate::update_data::AssociationUpdate;
use crate::update_data::ChildValue;
use crate::update_data::CollectionUpdate;
use crate::update_data::FunctionalAction;
use crate::update_data::ParsedRequest;
use crate::update_data::UpdateData;
use crate::viewmodel::ViewModel;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("{view}[{id}] could not be found: {detail}")]
    NotFound {
        view: ViewName,
        id: RecordId,
        detail: String,
    },
    #[error("{owner}.{association} does not accept {provided}")]
    TypeMismatch {
        owner: ViewName,
        association: String,
        provided: ViewName,
    },
    #[error("{reference} appears more than once across collection actions")]
    DuplicateReference { reference: Reference },
    #[error("{reference} is addressed by more than one update")]
    DuplicateNode { reference: Reference },
    #[error("{reference} already exists")]
    DuplicateRoot { reference: Reference },
    #[error("{view}.{attribute} is read-only")]
    ReadOnlyAttribute { view: ViewName, attribute: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Run,
}

/// Pointer rewrite a child applies to itself once its parent's record is
/// known.
#[derive(Debug, Clone)]
pub struct ParentLink {
    pub parent: OpId,
    /// Foreign-key column on the child.
    pub key_column: String,
}

/// A local-pointer child: saved before the owner, whose record id lands in
/// the owner's foreign-key column.
#[derive(Debug, Clone)]
pub struct LocalChild {
    /// Foreign-key column on the owner.
    pub key_column: String,
    /// Discriminator column on the owner, for polymorphic pointers.
    pub discriminator: Option<String>,
    pub child: OpId,
}

/// Post-save association cache rewrite.
#[derive(Debug, Clone)]
pub enum AssociationOps {
    One(Option<OpId>),
    Many(Vec<OpId>),
}

/// One node of the execution DAG.
#[derive(Debug)]
pub struct UpdateOperation {
    pub viewmodel: ViewModel,
    /// Column writes, already decoded and alias-resolved.
    pub attributes: IndexMap<String, Value>,
    pub reparent_to: Option<ParentLink>,
    /// Fresh list-attribute value, when the element moved or is new.
    pub reposition_to: Option<f64>,
    pub points_to: Vec<LocalChild>,
    pub pointed_to: Vec<OpId>,
    pub run_state: RunState,
    pub association_changed: bool,
    /// Names of the associations whose membership or order changed.
    pub changed_associations: Vec<String>,
    pub association_rewrites: Vec<(String, AssociationOps)>,
}

impl UpdateOperation {
    fn new(viewmodel: ViewModel) -> Self {
        UpdateOperation {
            viewmodel,
            attributes: IndexMap::new(),
            reparent_to: None,
            reposition_to: None,
            points_to: vec![],
            pointed_to: vec![],
            run_state: RunState::Pending,
            association_changed: false,
            changed_associations: vec![],
            association_rewrites: vec![],
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatePlan {
    ops: Vec<UpdateOperation>,
    roots: Vec<OpId>,
}

impl UpdatePlan {
    pub fn op(&self, id: OpId) -> &UpdateOperation {
        &self.ops[id.0]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut UpdateOperation {
        &mut self.ops[id.0]
    }

    pub fn roots(&self) -> &[OpId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push(&mut self, op: UpdateOperation) -> OpId {
        self.ops.push(op);
        OpId(self.ops.len() - 1)
    }
}

pub struct PlanOutcome {
    pub plan: UpdatePlan,
    pub pool: ReleasePool,
}

/// Builds the operation DAG for one parsed request.
pub fn plan_request(
    registry: &ViewRegistry,
    txn: &mut dyn StoreTransaction,
    request: &ParsedRequest,
) -> Result<PlanOutcome, PlanError> {
    let mut planner = Planner {
        registry,
        txn,
        references: &request.references,
        plan: UpdatePlan::default(),
        pool: ReleasePool::new(),
        built: HashMap::new(),
        ref_ops: HashMap::new(),
        preloaded: HashMap::new(),
    };
    let mut roots = Vec::with_capacity(request.roots.len());
    for root in &request.roots {
        let viewmodel = planner.resolve_node(root)?;
        roots.push(planner.build_op(viewmodel, root, None)?);
    }
    planner.plan.roots = roots;
    trace!(ops = planner.plan.len(), "built update plan");
    Ok(PlanOutcome {
        plan: planner.plan,
        pool: planner.pool,
    })
}

/// A slot of a collection's working list: the element's address, where its
/// update comes from, and the side-table key it arrived under, if any.
struct WorkingSlot {
    reference: Reference,
    key: Option<ReferenceKey>,
    source: SlotSource,
}

enum SlotSource {
    /// A current element the request does not explicitly edit.
    Current(ViewModel),
    /// A current element with an explicit update.
    CurrentUpdated(ViewModel, UpdateData),
    /// An element new to this collection: fresh, claimed, or loaded.
    Incoming(UpdateData),
}

impl SlotSource {
    /// Folds an explicit update into a slot's source.
    fn absorb(self, update: UpdateData) -> SlotSource {
        match self {
            SlotSource::Current(vm) | SlotSource::CurrentUpdated(vm, _) => {
                if update.is_noop() {
                    SlotSource::Current(vm)
                } else {
                    SlotSource::CurrentUpdated(vm, update)
                }
            }
            SlotSource::Incoming(_) => SlotSource::Incoming(update),
        }
    }
}

struct Planner<'a, 't> {
    registry: &'a ViewRegistry,
    txn: &'t mut dyn StoreTransaction,
    references: &'a IndexMap<ReferenceKey, UpdateData>,
    plan: UpdatePlan,
    pool: ReleasePool,
    /// Identified records already addressed by an operation.
    built: HashMap<Reference, OpId>,
    /// Side-table entries already built, shared between use sites.
    ref_ops: HashMap<ReferenceKey, OpId>,
    /// Records batch-loaded ahead of resolution.
    preloaded: HashMap<Reference, ViewModel>,
}

impl Planner<'_, '_> {
    /// Resolves a node that no current child matches: a fresh record, a
    /// claim of a prior release, a preloaded batch row, or a store load.
    fn resolve_node(&mut self, update: &UpdateData) -> Result<ViewModel, PlanError> {
        let descriptor = Arc::clone(&update.descriptor);
        if update.new {
            let mut viewmodel = ViewModel::new_record(descriptor);
            if let Some(id) = &update.id {
                self.reject_taken_identity(update, id)?;
                viewmodel.choose_id(id.clone());
            }
            return Ok(viewmodel);
        }
        let reference = update.reference();
        if let Some(entry) = self.pool.try_claim(&reference) {
            trace!(%reference, "claimed from the release pool");
            return Ok(entry.viewmodel);
        }
        if let Some(viewmodel) = self.preloaded.remove(&reference) {
            return Ok(viewmodel);
        }
        let id = update.id.clone().expect("a non-new update carries an id");
        self.load_record(&descriptor, &id)
    }

    /// A client-chosen identity must be genuinely new.
    fn reject_taken_identity(
        &mut self,
        update: &UpdateData,
        id: &RecordId,
    ) -> Result<(), PlanError> {
        let existing = self.txn.find(update.descriptor.record_type(), id)?;
        if existing.is_some() {
            return Err(PlanError::DuplicateRoot {
                reference: update.reference(),
            });
        }
        Ok(())
    }

    fn load_record(
        &mut self,
        descriptor: &Arc<ViewDescriptor>,
        id: &RecordId,
    ) -> Result<ViewModel, PlanError> {
        let record = self
            .txn
            .find(descriptor.record_type(), id)?
            .ok_or_else(|| PlanError::NotFound {
                view: descriptor.name().clone(),
                id: id.clone(),
                detail: "no such record".to_owned(),
            })?;
        Ok(ViewModel::from_record(Arc::clone(descriptor), record))
    }

    /// Batch-loads records of one view, through the owner's custom
    /// resolver when one is registered for the association.
    fn load_batch(
        &mut self,
        owner: &ViewDescriptor,
        association: &AssociationDescriptor,
        child: &Arc<ViewDescriptor>,
        ids: &[RecordId],
    ) -> Result<HashMap<RecordId, ViewModel>, PlanError> {
        let records: Vec<RecordData> = match owner.resolver(association.name()) {
            Some(resolver) => {
                let resolver = Arc::clone(resolver);
                resolver.resolve(self.txn, child.record_type(), ids)?
            }
            None => {
                let mut records = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(record) = self.txn.find(child.record_type(), id)? {
                        records.push(record);
                    }
                }
                records
            }
        };
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let id = record.id.clone()?;
                Some((id, ViewModel::from_record(Arc::clone(child), record)))
            })
            .collect())
    }

    /// Queues batch loads for the incoming identified elements of a
    /// collection that neither the pool nor an earlier operation supplies.
    fn preload_incoming(
        &mut self,
        owner: &ViewDescriptor,
        association: &AssociationDescriptor,
        slots: &[WorkingSlot],
    ) -> Result<(), PlanError> {
        let mut wanted: HashMap<ViewName, Vec<RecordId>> = HashMap::new();
        for slot in slots {
            let SlotSource::Incoming(update) = &slot.source else {
                continue;
            };
            let Some(id) = (!update.new).then(|| update.id.clone()).flatten() else {
                continue;
            };
            let reference = slot.reference.clone();
            if self.pool.contains(&reference)
                || self.built.contains_key(&reference)
                || self.preloaded.contains_key(&reference)
                || slot
                    .key
                    .as_ref()
                    .is_some_and(|key| self.ref_ops.contains_key(key))
            {
                continue;
            }
            wanted
                .entry(update.descriptor.name().clone())
                .or_default()
                .push(id);
        }
        for (view, ids) in wanted {
            let descriptor = self.registry.lookup(&view)?.clone();
            let loaded = self.load_batch(owner, association, &descriptor, &ids)?;
            for (id, viewmodel) in loaded {
                self.preloaded
                    .insert(Reference::persisted(view.clone(), id), viewmodel);
            }
        }
        Ok(())
    }

    /// Builds the operation for one resolved node and recursively plans its
    /// associations. The operation (and its side-table key, when it has
    /// one) is registered before recursion, so reference cycles become
    /// plain DAG back-edges for the executor to reject at run time.
    fn build_op(
        &mut self,
        viewmodel: ViewModel,
        update: &UpdateData,
        key: Option<&ReferenceKey>,
    ) -> Result<OpId, PlanError> {
        let reference = viewmodel.reference();
        let op_id = self.plan.push(UpdateOperation::new(viewmodel));
        if reference.id.is_some() && self.built.insert(reference.clone(), op_id).is_some() {
            return Err(PlanError::DuplicateNode { reference });
        }
        if let Some(key) = key {
            self.ref_ops.insert(key.clone(), op_id);
        }

        let attributes = self.attribute_writes(op_id, update)?;
        self.plan.op_mut(op_id).attributes = attributes;

        for (name, association_update) in &update.associations {
            let association = update
                .descriptor
                .association(name)
                .expect("parser resolved the association")
                .clone();
            match (association.pointer_location(), association.cardinality()) {
                (PointerLocation::Through, _) => {
                    self.plan_through(op_id, &update.descriptor, &association, association_update)?;
                }
                (_, Cardinality::One) => {
                    let AssociationUpdate::One(value) = association_update else {
                        unreachable!("parser matched the cardinality");
                    };
                    self.plan_single(op_id, &update.descriptor, &association, value.as_ref())?;
                }
                (_, Cardinality::Many) => {
                    let AssociationUpdate::Collection(value) = association_update else {
                        unreachable!("parser matched the cardinality");
                    };
                    self.plan_collection(op_id, &update.descriptor, &association, value)?;
                }
            }
        }
        Ok(op_id)
    }

    /// Alias-resolved column writes, with the read-only comparison against
    /// the loaded record.
    fn attribute_writes(
        &mut self,
        op_id: OpId,
        update: &UpdateData,
    ) -> Result<IndexMap<String, Value>, PlanError> {
        let mut writes = IndexMap::new();
        for (name, value) in &update.attributes {
            let attribute = update
                .descriptor
                .attribute(name)
                .expect("parser resolved the attribute");
            let persisted = self.plan.op(op_id).viewmodel.is_persisted();
            if (attribute.is_read_only() || attribute.is_write_once()) && persisted {
                let current = self.plan.op(op_id).viewmodel.attribute(attribute.column());
                if current.unwrap_or(&Value::Null) == value {
                    continue;
                }
                return Err(PlanError::ReadOnlyAttribute {
                    view: update.descriptor.name().clone(),
                    attribute: name.clone(),
                });
            }
            writes.insert(attribute.column().to_owned(), value.clone());
        }
        Ok(writes)
    }

    /// Resolves a child slot to its update data, type-checking side-table
    /// references. Also reports the slot's key and, for entries already
    /// built for another use site, the memoized operation.
    fn child_update(
        &mut self,
        owner: &ViewDescriptor,
        association: &AssociationDescriptor,
        child: &ChildValue,
    ) -> Result<(UpdateData, Option<ReferenceKey>, Option<OpId>), PlanError> {
        match child {
            ChildValue::Inline(update) => Ok((update.clone(), None, None)),
            ChildValue::Ref(key) => {
                let entry = self
                    .references
                    .get(key)
                    .expect("parser resolved side-table keys");
                if !association.accepts(entry.descriptor.name()) {
                    return Err(PlanError::TypeMismatch {
                        owner: owner.name().clone(),
                        association: association.name().to_owned(),
                        provided: entry.descriptor.name().clone(),
                    });
                }
                let memoized = self.ref_ops.get(key).copied();
                Ok((entry.clone(), Some(key.clone()), memoized))
            }
        }
    }

    fn release(
        &mut self,
        owner_op: OpId,
        association: &AssociationDescriptor,
        viewmodel: ViewModel,
    ) {
        let reference = viewmodel.reference();
        // Another update in this request already took the record over; the
        // move has effectively happened and there is nothing to destroy.
        if self.built.contains_key(&reference) {
            return;
        }
        let owner = self.plan.op(owner_op).viewmodel.reference();
        trace!(%reference, %owner, "released");
        self.pool.release(ReleaseEntry {
            viewmodel,
            owner,
            association: association.name().to_owned(),
            dependent: association.dependent_policy(),
            key_column: association.key_column().to_owned(),
        });
    }

    /// The owner's current child of a single association, if any.
    fn current_single_child(
        &mut self,
        owner_op: OpId,
        association: &AssociationDescriptor,
    ) -> Result<Option<ViewModel>, PlanError> {
        match association.pointer_location() {
            PointerLocation::Local => {
                let owner = &self.plan.op(owner_op).viewmodel;
                let key_value = owner.attribute(association.key_column()).cloned();
                let Some(id) = key_value.as_ref().and_then(RecordId::from_value) else {
                    return Ok(None);
                };
                let child_view = match association.polymorphism() {
                    Some(polymorphism) => {
                        let stored = owner
                            .attribute(&polymorphism.discriminator)
                            .and_then(Value::as_str)
                            .map(ViewName::new);
                        match stored {
                            Some(view) if association.accepts(&view) => view,
                            _ => return Ok(None),
                        }
                    }
                    None => association
                        .target_view()
                        .expect("non-polymorphic association has one target")
                        .clone(),
                };
                let descriptor = self.registry.lookup(&child_view)?.clone();
                match self.txn.find(descriptor.record_type(), &id)? {
                    Some(record) => Ok(Some(ViewModel::from_record(descriptor, record))),
                    None => Ok(None),
                }
            }
            PointerLocation::Remote => {
                let mut children = self.current_children(owner_op, association)?;
                Ok(if children.is_empty() {
                    None
                } else {
                    Some(children.remove(0))
                })
            }
            PointerLocation::Through => unreachable!("through associations are collections"),
        }
    }

    /// The owner's current children, in list order when the element views
    /// declare a list attribute, otherwise in primary-key order.
    fn current_children(
        &mut self,
        owner_op: OpId,
        association: &AssociationDescriptor,
    ) -> Result<Vec<ViewModel>, PlanError> {
        let Some(owner_id) = self.plan.op(owner_op).viewmodel.id().cloned() else {
            return Ok(vec![]);
        };
        let mut children = vec![];
        for view in association.accepted_views() {
            let descriptor = self.registry.lookup(view)?.clone();
            for record in self.txn.find_owned(
                descriptor.record_type(),
                association.key_column(),
                &owner_id,
            )? {
                children.push(ViewModel::from_record(Arc::clone(&descriptor), record));
            }
        }
        sort_by_list_position(&mut children);
        Ok(children)
    }

    fn plan_single(
        &mut self,
        owner_op: OpId,
        owner: &Arc<ViewDescriptor>,
        association: &AssociationDescriptor,
        value: Option<&ChildValue>,
    ) -> Result<(), PlanError> {
        let current = self.current_single_child(owner_op, association)?;
        let current_reference = current.as_ref().map(|vm| vm.reference());

        let resolved = match value {
            None => None,
            Some(child) => {
                let (update, key, memoized) = self.child_update(owner, association, child)?;
                let op = match memoized {
                    Some(op) => op,
                    None => {
                        let viewmodel = match &current {
                            Some(current_vm)
                                if !update.new
                                    && current_vm.reference() == update.reference() =>
                            {
                                current_vm.clone()
                            }
                            _ => self.resolve_node(&update)?,
                        };
                        self.build_op(viewmodel, &update, key.as_ref())?
                    }
                };
                Some(op)
            }
        };

        let new_reference = resolved.map(|op| self.plan.op(op).viewmodel.reference());
        let changed = current_reference != new_reference;
        if changed {
            if let Some(current_vm) = current {
                self.release(owner_op, association, current_vm);
            }
            let op = self.plan.op_mut(owner_op);
            op.association_changed = true;
            op.changed_associations.push(association.name().to_owned());
        }

        match association.pointer_location() {
            PointerLocation::Local => {
                let discriminator = association.polymorphism().map(|p| p.discriminator.clone());
                match resolved {
                    Some(child) => {
                        self.plan.op_mut(owner_op).points_to.push(LocalChild {
                            key_column: association.key_column().to_owned(),
                            discriminator,
                            child,
                        });
                    }
                    None if changed => {
                        let op = self.plan.op_mut(owner_op);
                        op.attributes
                            .insert(association.key_column().to_owned(), Value::Null);
                        if let Some(column) = discriminator {
                            op.attributes.insert(column, Value::Null);
                        }
                    }
                    None => {}
                }
            }
            PointerLocation::Remote => {
                if let Some(child) = resolved {
                    let child_op = self.plan.op_mut(child);
                    if child_op.reparent_to.is_none() {
                        child_op.reparent_to = Some(ParentLink {
                            parent: owner_op,
                            key_column: association.key_column().to_owned(),
                        });
                    }
                    self.plan.op_mut(owner_op).pointed_to.push(child);
                }
            }
            PointerLocation::Through => unreachable!("through associations are collections"),
        }

        self.plan
            .op_mut(owner_op)
            .association_rewrites
            .push((association.name().to_owned(), AssociationOps::One(resolved)));
        Ok(())
    }

    fn plan_collection(
        &mut self,
        owner_op: OpId,
        owner: &Arc<ViewDescriptor>,
        association: &AssociationDescriptor,
        update: &CollectionUpdate,
    ) -> Result<(), PlanError> {
        let current = self.current_children(owner_op, association)?;
        let current_order = current.iter().map(|vm| vm.reference()).collect_vec();

        let slots = self.working_list(owner_op, owner, association, current, update)?;
        self.preload_incoming(owner, association, &slots)?;

        // Build in final list order; children point back at the owner.
        let mut child_ops = Vec::with_capacity(slots.len());
        let mut positions = Vec::with_capacity(slots.len());
        for slot in slots {
            let memoized = slot
                .key
                .as_ref()
                .and_then(|key| self.ref_ops.get(key).copied());
            let op = match memoized {
                Some(op) => {
                    positions.push(None);
                    op
                }
                None => {
                    let (viewmodel, update) = match slot.source {
                        SlotSource::Current(viewmodel) => {
                            let update = UpdateData::empty(
                                Arc::clone(viewmodel.descriptor()),
                                viewmodel
                                    .id()
                                    .cloned()
                                    .expect("current children are persisted"),
                            );
                            (viewmodel, update)
                        }
                        SlotSource::CurrentUpdated(viewmodel, update) => (viewmodel, update),
                        SlotSource::Incoming(update) => (self.resolve_node(&update)?, update),
                    };
                    positions.push(list_position(&viewmodel));
                    self.build_op(viewmodel, &update, slot.key.as_ref())?
                }
            };
            let child_op = self.plan.op_mut(op);
            if child_op.reparent_to.is_none() {
                child_op.reparent_to = Some(ParentLink {
                    parent: owner_op,
                    key_column: association.key_column().to_owned(),
                });
            }
            child_ops.push(op);
        }

        self.assign_positions(&child_ops, &positions);

        let final_order = child_ops
            .iter()
            .map(|op| self.plan.op(*op).viewmodel.reference())
            .collect_vec();
        if final_order != current_order {
            let op = self.plan.op_mut(owner_op);
            op.association_changed = true;
            op.changed_associations.push(association.name().to_owned());
        }

        let op = self.plan.op_mut(owner_op);
        op.pointed_to.extend(child_ops.iter().copied());
        op.association_rewrites.push((
            association.name().to_owned(),
            AssociationOps::Many(child_ops),
        ));
        Ok(())
    }

    /// Applies a collection update over the current children, producing the
    /// final ordered working list and releasing dropped elements.
    fn working_list(
        &mut self,
        owner_op: OpId,
        owner: &Arc<ViewDescriptor>,
        association: &AssociationDescriptor,
        current: Vec<ViewModel>,
        update: &CollectionUpdate,
    ) -> Result<Vec<WorkingSlot>, PlanError> {
        match update {
            CollectionUpdate::Replace(values) => {
                let mut remaining: IndexMap<Reference, ViewModel> = current
                    .into_iter()
                    .map(|vm| (vm.reference(), vm))
                    .collect();
                let mut slots = Vec::with_capacity(values.len());
                for value in values {
                    let (update, key, _) = self.child_update(owner, association, value)?;
                    let reference = update.reference();
                    let source = match remaining.shift_remove(&reference) {
                        Some(viewmodel) if !update.new => {
                            SlotSource::CurrentUpdated(viewmodel, update)
                        }
                        _ => SlotSource::Incoming(update),
                    };
                    slots.push(WorkingSlot {
                        reference,
                        key,
                        source,
                    });
                }
                for (_, dropped) in remaining {
                    self.release(owner_op, association, dropped);
                }
                Ok(slots)
            }
            CollectionUpdate::Functional(actions) => {
                self.apply_actions(owner_op, owner, association, current, actions)
            }
        }
    }

    fn apply_actions(
        &mut self,
        owner_op: OpId,
        owner: &Arc<ViewDescriptor>,
        association: &AssociationDescriptor,
        current: Vec<ViewModel>,
        actions: &[FunctionalAction],
    ) -> Result<Vec<WorkingSlot>, PlanError> {
        let mut working: Vec<WorkingSlot> = current
            .into_iter()
            .map(|vm| WorkingSlot {
                reference: vm.reference(),
                key: None,
                source: SlotSource::Current(vm),
            })
            .collect();
        // A reference may be named by at most one action value per request.
        let mut touched: HashSet<Reference> = HashSet::new();

        for action in actions {
            match action {
                FunctionalAction::Append {
                    values,
                    before,
                    after,
                } => {
                    let mut block = Vec::with_capacity(values.len());
                    for value in values {
                        let (update, key, _) = self.child_update(owner, association, value)?;
                        let reference = update.reference();
                        touch(&mut touched, &reference)?;
                        // An element already in the list moves rather than
                        // duplicating; the appended payload becomes its
                        // update.
                        let at = working.iter().position(|slot| {
                            slot.reference.id.is_some() && slot.reference == reference
                        });
                        let source = match at.map(|at| working.remove(at)) {
                            Some(slot) => slot.source.absorb(update),
                            None => SlotSource::Incoming(update),
                        };
                        block.push(WorkingSlot {
                            reference,
                            key,
                            source,
                        });
                    }
                    let at = match (before, after) {
                        (Some(anchor), _) => self.anchor_index(&working, anchor)?,
                        (None, Some(anchor)) => self.anchor_index(&working, anchor)? + 1,
                        (None, None) => working.len(),
                    };
                    working.splice(at..at, block);
                }
                FunctionalAction::Remove { values } => {
                    for key in values {
                        let reference = self.key_reference(owner, association, key)?;
                        touch(&mut touched, &reference)?;
                        let at = working
                            .iter()
                            .position(|slot| slot.reference == reference)
                            .ok_or_else(|| not_in_collection(&reference))?;
                        let removed = working.remove(at);
                        match removed.source {
                            SlotSource::Current(vm) | SlotSource::CurrentUpdated(vm, _) => {
                                self.release(owner_op, association, vm);
                            }
                            SlotSource::Incoming(_) => {}
                        }
                    }
                }
                FunctionalAction::Update { values } => {
                    for value in values {
                        let (update, _, _) = self.child_update(owner, association, value)?;
                        let reference = update.reference();
                        touch(&mut touched, &reference)?;
                        let at = working
                            .iter()
                            .position(|slot| slot.reference == reference)
                            .ok_or_else(|| not_in_collection(&reference))?;
                        let slot = working.remove(at);
                        let source = slot.source.absorb(update);
                        working.insert(
                            at,
                            WorkingSlot {
                                reference,
                                key: slot.key,
                                source,
                            },
                        );
                    }
                }
            }
        }
        Ok(working)
    }

    /// Reference an action key resolves to through the side-table.
    fn key_reference(
        &self,
        owner: &ViewDescriptor,
        association: &AssociationDescriptor,
        key: &ReferenceKey,
    ) -> Result<Reference, PlanError> {
        let entry = self
            .references
            .get(key)
            .expect("parser resolved side-table keys");
        if !association.accepts(entry.descriptor.name()) {
            return Err(PlanError::TypeMismatch {
                owner: owner.name().clone(),
                association: association.name().to_owned(),
                provided: entry.descriptor.name().clone(),
            });
        }
        Ok(entry.reference())
    }

    /// Index of the anchor element, after the same append's moves have been
    /// taken out of the working list.
    fn anchor_index(
        &self,
        working: &[WorkingSlot],
        anchor: &ReferenceKey,
    ) -> Result<usize, PlanError> {
        let entry = self
            .references
            .get(anchor)
            .expect("parser resolved side-table keys");
        let reference = entry.reference();
        working
            .iter()
            .position(|slot| slot.reference == reference)
            .ok_or_else(|| not_in_collection(&reference))
    }

    /// Assigns interleaved list positions over the final order. Elements
    /// already holding a compatible position keep their row untouched.
    fn assign_positions(&mut self, child_ops: &[OpId], current_positions: &[Option<f64>]) {
        let list_ordered = child_ops.iter().any(|op| {
            self.plan
                .op(*op)
                .viewmodel
                .descriptor()
                .list_attribute()
                .is_some()
        });
        if !list_ordered || child_ops.is_empty() {
            return;
        }
        let assigned = interleaved_positions(current_positions);
        for (op, (position, current)) in child_ops
            .iter()
            .zip(assigned.iter().zip(current_positions))
        {
            if Some(*position) != *current {
                self.plan.op_mut(*op).reposition_to = Some(*position);
            }
        }
    }

    fn plan_through(
        &mut self,
        owner_op: OpId,
        owner: &Arc<ViewDescriptor>,
        association: &AssociationDescriptor,
        update: &AssociationUpdate,
    ) -> Result<(), PlanError> {
        let through = association
            .through_spec()
            .expect("descriptor validated the through spec")
            .clone();
        let join_descriptor = self.registry.lookup(&through.join_view)?.clone();
        let target_view = association
            .target_view()
            .expect("through associations have one target")
            .clone();
        let target_descriptor = self.registry.lookup(&target_view)?.clone();

        // Current joins in list order; each names one target.
        let owner_id = self.plan.op(owner_op).viewmodel.id().cloned();
        let mut current_joins: Vec<ViewModel> = match &owner_id {
            Some(id) => self
                .txn
                .find_owned(join_descriptor.record_type(), &through.source_key, id)?
                .into_iter()
                .map(|record| ViewModel::from_record(Arc::clone(&join_descriptor), record))
                .collect(),
            None => vec![],
        };
        sort_by_list_position(&mut current_joins);

        let current_target_ids: Vec<RecordId> = current_joins
            .iter()
            .filter_map(|join| {
                join.attribute(&through.target_key)
                    .and_then(RecordId::from_value)
            })
            .collect();
        let mut loaded =
            self.load_batch(owner, association, &target_descriptor, &current_target_ids)?;
        let current: Vec<ViewModel> = current_target_ids
            .iter()
            .filter_map(|id| loaded.remove(id))
            .collect();
        let current_order: Vec<Reference> = current.iter().map(|vm| vm.reference()).collect();

        let AssociationUpdate::Collection(collection) = update else {
            unreachable!("through associations are collections");
        };
        // Dropped targets are not released; only their joins go. The
        // action algebra itself is the same as for plain collections.
        let slots = match collection {
            CollectionUpdate::Replace(values) => {
                let mut remaining: IndexMap<Reference, ViewModel> = current
                    .into_iter()
                    .map(|vm| (vm.reference(), vm))
                    .collect();
                let mut slots = Vec::with_capacity(values.len());
                for value in values {
                    let (update, key, _) = self.child_update(owner, association, value)?;
                    let reference = update.reference();
                    let source = match remaining.shift_remove(&reference) {
                        Some(viewmodel) if !update.new => {
                            if update.is_noop() {
                                SlotSource::Current(viewmodel)
                            } else {
                                SlotSource::CurrentUpdated(viewmodel, update)
                            }
                        }
                        _ => SlotSource::Incoming(update),
                    };
                    slots.push(WorkingSlot {
                        reference,
                        key,
                        source,
                    });
                }
                slots
            }
            CollectionUpdate::Functional(actions) => {
                self.apply_target_actions(owner, association, current, actions)?
            }
        };
        self.preload_incoming(owner, association, &slots)?;

        // Targets first: a join's local pointer must resolve before the
        // join saves.
        let mut final_targets: Vec<(Reference, Option<OpId>)> = Vec::with_capacity(slots.len());
        for slot in slots {
            let memoized = slot
                .key
                .as_ref()
                .and_then(|key| self.ref_ops.get(key).copied());
            match (memoized, slot.source) {
                (Some(op), _) => {
                    final_targets.push((self.plan.op(op).viewmodel.reference(), Some(op)));
                }
                (None, SlotSource::Current(_)) => final_targets.push((slot.reference, None)),
                (None, SlotSource::CurrentUpdated(viewmodel, update)) => {
                    let op = self.build_op(viewmodel, &update, slot.key.as_ref())?;
                    final_targets.push((slot.reference, Some(op)));
                }
                (None, SlotSource::Incoming(update)) => {
                    let viewmodel = self.resolve_node(&update)?;
                    let op = self.build_op(viewmodel, &update, slot.key.as_ref())?;
                    final_targets.push((self.plan.op(op).viewmodel.reference(), Some(op)));
                }
            }
        }

        // Join synthesis: reuse rows that keep their target, create the
        // rest, release the leftovers. The join's only writable attribute
        // is the indirect foreign key; position is assigned on the join.
        let mut remaining_joins = current_joins;
        let mut join_ops = Vec::with_capacity(final_targets.len());
        let mut join_positions = Vec::with_capacity(final_targets.len());
        for (target_reference, target_op) in &final_targets {
            let matched = remaining_joins.iter().position(|join| {
                join.attribute(&through.target_key)
                    .and_then(RecordId::from_value)
                    .as_ref()
                    == target_reference.id.as_ref()
            });
            let (join_vm, join_update) = match matched {
                Some(at) => {
                    let join_vm = remaining_joins.remove(at);
                    let update = UpdateData::empty(
                        Arc::clone(&join_descriptor),
                        join_vm.id().cloned().expect("joins are persisted"),
                    );
                    (join_vm, update)
                }
                None => (
                    ViewModel::new_record(Arc::clone(&join_descriptor)),
                    UpdateData::new_record(Arc::clone(&join_descriptor)),
                ),
            };
            join_positions.push(list_position(&join_vm));
            let join_op = self.build_op(join_vm, &join_update, None)?;
            self.plan.op_mut(join_op).reparent_to = Some(ParentLink {
                parent: owner_op,
                key_column: through.source_key.clone(),
            });
            match target_op {
                Some(target) => {
                    self.plan.op_mut(join_op).points_to.push(LocalChild {
                        key_column: through.target_key.clone(),
                        discriminator: None,
                        child: *target,
                    });
                }
                None => {
                    // Target untouched; its id is already known.
                    let id = target_reference
                        .id
                        .clone()
                        .expect("current targets are persisted");
                    self.plan
                        .op_mut(join_op)
                        .attributes
                        .insert(through.target_key.clone(), id.to_value());
                }
            }
            join_ops.push(join_op);
        }

        for dropped in remaining_joins {
            self.release_join(owner_op, association, &through, dropped);
        }

        self.assign_positions(&join_ops, &join_positions);

        let final_order = final_targets.iter().map(|(r, _)| r.clone()).collect_vec();
        if final_order != current_order {
            let op = self.plan.op_mut(owner_op);
            op.association_changed = true;
            op.changed_associations.push(association.name().to_owned());
        }
        self.plan
            .op_mut(owner_op)
            .pointed_to
            .extend(join_ops.iter().copied());
        Ok(())
    }

    /// The functional action algebra over through-association targets.
    /// Removals only drop joins, so nothing is released here.
    fn apply_target_actions(
        &mut self,
        owner: &Arc<ViewDescriptor>,
        association: &AssociationDescriptor,
        current: Vec<ViewModel>,
        actions: &[FunctionalAction],
    ) -> Result<Vec<WorkingSlot>, PlanError> {
        let mut working: Vec<WorkingSlot> = current
            .into_iter()
            .map(|vm| WorkingSlot {
                reference: vm.reference(),
                key: None,
                source: SlotSource::Current(vm),
            })
            .collect();
        let mut touched: HashSet<Reference> = HashSet::new();

        for action in actions {
            match action {
                FunctionalAction::Append {
                    values,
                    before,
                    after,
                } => {
                    let mut block = Vec::with_capacity(values.len());
                    for value in values {
                        let (update, key, _) = self.child_update(owner, association, value)?;
                        let reference = update.reference();
                        touch(&mut touched, &reference)?;
                        let at = working.iter().position(|slot| {
                            slot.reference.id.is_some() && slot.reference == reference
                        });
                        let source = match at.map(|at| working.remove(at)) {
                            Some(slot) => slot.source.absorb(update),
                            None => SlotSource::Incoming(update),
                        };
                        block.push(WorkingSlot {
                            reference,
                            key,
                            source,
                        });
                    }
                    let at = match (before, after) {
                        (Some(anchor), _) => self.anchor_index(&working, anchor)?,
                        (None, Some(anchor)) => self.anchor_index(&working, anchor)? + 1,
                        (None, None) => working.len(),
                    };
                    working.splice(at..at, block);
                }
                FunctionalAction::Remove { values } => {
                    for key in values {
                        let reference = self.key_reference(owner, association, key)?;
                        touch(&mut touched, &reference)?;
                        let at = working
                            .iter()
                            .position(|slot| slot.reference == reference)
                            .ok_or_else(|| not_in_collection(&reference))?;
                        working.remove(at);
                    }
                }
                FunctionalAction::Update { values } => {
                    for value in values {
                        let (update, _, _) = self.child_update(owner, association, value)?;
                        let reference = update.reference();
                        touch(&mut touched, &reference)?;
                        let at = working
                            .iter()
                            .position(|slot| slot.reference == reference)
                            .ok_or_else(|| not_in_collection(&reference))?;
                        let slot = working.remove(at);
                        let source = slot.source.absorb(update);
                        working.insert(
                            at,
                            WorkingSlot {
                                reference,
                                key: slot.key,
                                source,
                            },
                        );
                    }
                }
            }
        }
        Ok(working)
    }

    fn release_join(
        &mut self,
        owner_op: OpId,
        association: &AssociationDescriptor,
        through: &ThroughSpec,
        join: ViewModel,
    ) {
        let owner = self.plan.op(owner_op).viewmodel.reference();
        self.pool.release(ReleaseEntry {
            viewmodel: join,
            owner,
            association: association.name().to_owned(),
            // Join rows are pure edges; dropping the edge removes the row.
            dependent: Some(
                association
                    .dependent_policy()
                    .unwrap_or(DependentPolicy::Delete),
            ),
            key_column: through.source_key.clone(),
        });
    }
}

fn touch(touched: &mut HashSet<Reference>, reference: &Reference) -> Result<(), PlanError> {
    if reference.id.is_some() && !touched.insert(reference.clone()) {
        return Err(PlanError::DuplicateReference {
            reference: reference.clone(),
        });
    }
    Ok(())
}

fn not_in_collection(reference: &Reference) -> PlanError {
    PlanError::NotFound {
        view: reference.view.clone(),
        id: reference
            .id
            .clone()
            .unwrap_or_else(|| RecordId::Text("new".to_owned())),
        detail: "not in the collection".to_owned(),
    }
}

fn list_position(viewmodel: &ViewModel) -> Option<f64> {
    let column = viewmodel.descriptor().list_attribute()?;
    viewmodel.attribute(column).and_then(Value::as_f64)
}

fn sort_by_list_position(children: &mut [ViewModel]) {
    if children.iter().all(|vm| list_position(vm).is_none()) {
        return;
    }
    children.sort_by(|a, b| {
        let (a, b) = (list_position(a), list_position(b));
        a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
    });
}
