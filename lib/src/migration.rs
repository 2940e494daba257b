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

//! Schema-version migrations.
//!
//! Authors register pairwise version transitions per view; the transitions
//! form a directed graph over versions. A shortest path between the client
//! version and the server's current version is computed once per pair and
//! cached on the descriptor. [`UpMigrator`] rewrites incoming trees before
//! parsing, [`DownMigrator`] rewrites outgoing trees after serialization.
//! Transforms see the generic view shape and may read or write the
//! references side-table.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::dag_walk;
use crate::descriptor::ViewDescriptor;
use crate::reference::ViewName;
use crate::registry::RegistryError;
use crate::registry::ViewRegistry;
use crate::wire;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("no migration path for {view} from version {from} to {to}")]
    NoPath { view: ViewName, from: u64, to: u64 },
    #[error("migrations for {view} do not cover version {version}")]
    MigrationsIncomplete { view: ViewName, version: u64 },
    #[error("migration for {view} from version {from} to {to} is one-way")]
    OneWay { view: ViewName, from: u64, to: u64 },
    #[error("migration transform for {view} failed: {message}")]
    Transform { view: ViewName, message: String },
    #[error("{view}: _version is not a schema version")]
    InvalidVersion { view: ViewName },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Rewrites one view object between two adjacent schema versions. Returns a
/// message on failure; the migrator attaches the view name.
pub type TransformFn =
    Arc<dyn Fn(&mut Map<String, Value>, &mut MigrationScope<'_>) -> Result<(), String> + Send + Sync>;

/// What a transform may touch besides its own view object.
pub struct MigrationScope<'a> {
    /// The request's references side-table, minus the entry being migrated.
    pub references: &'a mut Map<String, Value>,
}

/// One registered version transition: an `up` transform and, unless the
/// migration is one-way, a `down` transform.
#[derive(Clone)]
pub struct Migration {
    from: u64,
    to: u64,
    up: TransformFn,
    down: Option<TransformFn>,
}

impl Debug for Migration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("one_way", &self.down.is_none())
            .finish()
    }
}

impl Migration {
    pub fn new(
        from: u64,
        to: u64,
        up: impl Fn(&mut Map<String, Value>, &mut MigrationScope<'_>) -> Result<(), String>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Migration {
            from,
            to,
            up: Arc::new(up),
            down: None,
        }
    }

    pub fn down(
        mut self,
        down: impl Fn(&mut Map<String, Value>, &mut MigrationScope<'_>) -> Result<(), String>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.down = Some(Arc::new(down));
        self
    }

    pub fn from(&self) -> u64 {
        self.from
    }

    pub fn to(&self) -> u64 {
        self.to
    }

    pub fn is_one_way(&self) -> bool {
        self.down.is_none()
    }
}

/// Shortest edge path from `from` to `to`, as indexes into the descriptor's
/// migration list, cached per pair.
fn migration_path(
    descriptor: &ViewDescriptor,
    from: u64,
    to: u64,
) -> Result<Vec<usize>, MigrationError> {
    for version in [from, to] {
        if !descriptor.known_version(version) {
            return Err(MigrationError::MigrationsIncomplete {
                view: descriptor.name().clone(),
                version,
            });
        }
    }
    if from == to {
        return Ok(vec![]);
    }
    let mut cache = descriptor.path_cache.lock().unwrap();
    let cached = cache.entry((from, to)).or_insert_with(|| {
        let migrations = descriptor.migrations();
        let nodes = dag_walk::shortest_path(
            from,
            |v| *v == to,
            |v| *v,
            |v| {
                migrations
                    .iter()
                    .filter(|m| m.from() == *v)
                    .map(|m| m.to())
                    .collect::<Vec<_>>()
            },
        )?;
        let edge_of = |a: u64, b: u64| {
            migrations
                .iter()
                .position(|m| m.from() == a && m.to() == b)
                .expect("path edge must exist")
        };
        Some(
            nodes
                .windows(2)
                .map(|pair| edge_of(pair[0], pair[1]))
                .collect(),
        )
    });
    match cached {
        Some(path) => Ok(path.clone()),
        None => Err(MigrationError::NoPath {
            view: descriptor.name().clone(),
            from,
            to,
        }),
    }
}

fn node_version(view: &ViewName, node: &Map<String, Value>, current: u64) -> Result<u64, MigrationError> {
    match node.get(wire::VERSION) {
        None => Ok(current),
        Some(value) => value
            .as_u64()
            .filter(|v| *v > 0)
            .ok_or_else(|| MigrationError::InvalidVersion { view: view.clone() }),
    }
}

fn apply_transform(
    view: &ViewName,
    transform: &TransformFn,
    node: &mut Map<String, Value>,
    scope: &mut MigrationScope<'_>,
) -> Result<(), MigrationError> {
    transform(node, scope).map_err(|message| MigrationError::Transform {
        view: view.clone(),
        message,
    })
}

/// Routes incoming view trees forward to the server's current schema
/// versions, in place.
pub struct UpMigrator<'a> {
    registry: &'a ViewRegistry,
}

impl<'a> UpMigrator<'a> {
    pub fn new(registry: &'a ViewRegistry) -> Self {
        UpMigrator { registry }
    }

    pub fn migrate(
        &self,
        payload: &mut Value,
        references: &mut Map<String, Value>,
    ) -> Result<(), MigrationError> {
        migrate_payload(payload, references, &mut |node, refs| {
            self.migrate_node(node, refs)
        })
    }

    fn migrate_node(
        &self,
        node: &mut Map<String, Value>,
        references: &mut Map<String, Value>,
    ) -> Result<(), MigrationError> {
        let Some(descriptor) = registered_view(self.registry, node) else {
            return Ok(());
        };
        let current = descriptor.schema_version();
        let from = node_version(descriptor.name(), node, current)?;
        if !descriptor.accepts_schema_version(from) {
            let path = migration_path(&descriptor, from, current)?;
            let mut scope = MigrationScope { references };
            for index in path {
                let migration = &descriptor.migrations()[index];
                apply_transform(descriptor.name(), &migration.up, node, &mut scope)?;
            }
        }
        node.insert(wire::VERSION.to_owned(), Value::from(current));
        Ok(())
    }
}

/// Routes outgoing view trees backward to the schema versions a client
/// requested, in place. Views without a requested version stay current.
pub struct DownMigrator<'a> {
    registry: &'a ViewRegistry,
    versions: &'a HashMap<ViewName, u64>,
}

impl<'a> DownMigrator<'a> {
    pub fn new(registry: &'a ViewRegistry, versions: &'a HashMap<ViewName, u64>) -> Self {
        DownMigrator { registry, versions }
    }

    pub fn migrate(
        &self,
        payload: &mut Value,
        references: &mut Map<String, Value>,
    ) -> Result<(), MigrationError> {
        migrate_payload(payload, references, &mut |node, refs| {
            self.migrate_node(node, refs)
        })
    }

    fn migrate_node(
        &self,
        node: &mut Map<String, Value>,
        references: &mut Map<String, Value>,
    ) -> Result<(), MigrationError> {
        let Some(descriptor) = registered_view(self.registry, node) else {
            return Ok(());
        };
        let Some(&target) = self.versions.get(descriptor.name()) else {
            return Ok(());
        };
        let current = descriptor.schema_version();
        if target == current {
            return Ok(());
        }
        // The graph is searched in the up direction; the down walk replays
        // the same edges in reverse.
        let path = migration_path(&descriptor, target, current)?;
        let mut scope = MigrationScope { references };
        for index in path.iter().rev() {
            let migration = &descriptor.migrations()[*index];
            let Some(down) = &migration.down else {
                return Err(MigrationError::OneWay {
                    view: descriptor.name().clone(),
                    from: migration.from(),
                    to: migration.to(),
                });
            };
            apply_transform(descriptor.name(), down, node, &mut scope)?;
        }
        node.insert(wire::VERSION.to_owned(), Value::from(target));
        Ok(())
    }
}

fn registered_view(
    registry: &ViewRegistry,
    node: &Map<String, Value>,
) -> Option<Arc<ViewDescriptor>> {
    let name = node.get(wire::TYPE)?.as_str()?;
    if wire::is_reserved_type(name) {
        return None;
    }
    registry.get(&ViewName::new(name)).cloned()
}

/// Applies `migrate_node` to every view object in the payload and in the
/// references side-table, recursing into association values.
fn migrate_payload(
    payload: &mut Value,
    references: &mut Map<String, Value>,
    migrate_node: &mut impl FnMut(
        &mut Map<String, Value>,
        &mut Map<String, Value>,
    ) -> Result<(), MigrationError>,
) -> Result<(), MigrationError> {
    migrate_value(payload, references, migrate_node)?;
    // Entries are migrated one at a time, each seeing the rest of the
    // side-table through its scope.
    let keys: Vec<String> = references.keys().cloned().collect();
    for key in keys {
        let Some(mut entry) = references.remove(&key) else {
            continue;
        };
        let result = migrate_value(&mut entry, references, migrate_node);
        references.insert(key, entry);
        result?;
    }
    Ok(())
}

fn migrate_value(
    value: &mut Value,
    references: &mut Map<String, Value>,
    migrate_node: &mut impl FnMut(
        &mut Map<String, Value>,
        &mut Map<String, Value>,
    ) -> Result<(), MigrationError>,
) -> Result<(), MigrationError> {
    match value {
        Value::Array(items) => {
            for item in items {
                migrate_value(item, references, migrate_node)?;
            }
            Ok(())
        }
        Value::Object(node) => {
            migrate_node(node, references)?;
            for (key, nested) in node.iter_mut() {
                if wire::is_reserved_key(key) {
                    continue;
                }
                migrate_value(nested, references, migrate_node)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
