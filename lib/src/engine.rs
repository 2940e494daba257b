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

//! The engine facade.
//!
//! Owns the registry and a store handle and wires the subsystems together
//! in request order. For a write: up-migrate, parse, plan, execute inside
//! one transaction, serialize the response, commit, then down-migrate the
//! response to the versions the client asked for. The read path skips
//! straight to the serializer.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Map;
use serde_json::Value;
use tracing::info_span;

use crate::change::ChangeSummary;
use crate::error::Error;
use crate::executor::Executor;
use crate::migration::DownMigrator;
use crate::migration::UpMigrator;
use crate::parser::Parser;
use crate::plan::plan_request;
use crate::record::RecordId;
use crate::reference::Reference;
use crate::reference::ViewName;
use crate::registry::ViewRegistry;
use crate::serializer::prune_unreachable;
use crate::serializer::SerializedPayload;
use crate::serializer::Serializer;
use crate::store::Store;

/// Per-call serialization options.
#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    /// Schema version the response should carry, per view. Views not named
    /// stay at the server's current version.
    pub versions: HashMap<ViewName, u64>,
}

/// What a successful write returns: the serialized response plus the change
/// summaries the tracker collected.
#[derive(Debug)]
pub struct DeserializeResponse {
    pub payload: SerializedPayload,
    pub changes: IndexMap<Reference, ChangeSummary>,
}

#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<ViewRegistry>,
    store: Arc<dyn Store>,
}

impl Engine {
    pub fn new(registry: Arc<ViewRegistry>, store: Arc<dyn Store>) -> Self {
        Engine { registry, store }
    }

    pub fn registry(&self) -> &Arc<ViewRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Applies a write payload and returns the updated trees. Any error
    /// drops the transaction uncommitted, so no partial writes persist.
    pub fn deserialize(
        &self,
        payload: &Value,
        references: &Map<String, Value>,
        params: &Value,
        options: &SerializeOptions,
    ) -> Result<DeserializeResponse, Error> {
        let span = info_span!("deserialize");
        let _enter = span.enter();

        let mut payload = payload.clone();
        let mut references = references.clone();
        UpMigrator::new(&self.registry).migrate(&mut payload, &mut references)?;

        let request = Parser::new(&self.registry).parse(&payload, &references)?;
        let multiple_roots = payload.is_array();

        let mut txn = self.store.begin().map_err(Error::Store)?;
        let outcome = {
            let txn = txn.as_mut();
            let mut planned = plan_request(&self.registry, txn, &request)?;
            let executed =
                Executor::new(txn, params).execute(&mut planned.plan, &mut planned.pool)?;
            let serializer = Serializer::new(&self.registry, txn, params);
            let mut payload = serializer.serialize_views(&executed.roots)?;
            if multiple_roots && !payload.data.is_array() {
                payload.data = Value::Array(vec![payload.data]);
            }
            (payload, executed.changes)
        };
        txn.commit().map_err(Error::Store)?;

        let (mut payload, changes) = outcome;
        self.migrate_down(&mut payload, options)?;
        Ok(DeserializeResponse {
            payload,
            changes: changes.into_changes(),
        })
    }

    /// Loads and serializes the given roots (the read path).
    pub fn serialize(
        &self,
        roots: &[(ViewName, RecordId)],
        params: &Value,
        options: &SerializeOptions,
    ) -> Result<SerializedPayload, Error> {
        let mut txn = self.store.begin().map_err(Error::Store)?;
        let serializer = Serializer::new(&self.registry, txn.as_mut(), params);
        let mut payload = serializer.serialize_records(roots)?;
        txn.rollback().map_err(Error::Store)?;
        self.migrate_down(&mut payload, options)?;
        Ok(payload)
    }

    fn migrate_down(
        &self,
        payload: &mut SerializedPayload,
        options: &SerializeOptions,
    ) -> Result<(), Error> {
        if options.versions.is_empty() {
            return Ok(());
        }
        DownMigrator::new(&self.registry, &options.versions)
            .migrate(&mut payload.data, &mut payload.references)?;
        // Migrations may rewrite or drop references; sweep again.
        prune_unreachable(&payload.data, &mut payload.references);
        Ok(())
    }
}
