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

//! In-memory reference implementation of the storage interface.
//!
//! Transactions take a snapshot of all tables and publish it on commit, so
//! rollback is a drop. Rows live in primary-key order. Optimistic locking,
//! foreign keys, and row checks mirror what a relational driver would
//! surface, which makes this store the substrate for the whole test suite.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Mutex;

use indexmap::IndexMap;
use serde_json::Value;

use crate::record::RecordData;
use crate::record::RecordId;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::StoreTransaction;

/// Injectable per-table row validation, returning per-column messages.
pub type RowCheck = Box<dyn Fn(&IndexMap<String, Value>) -> Vec<(String, String)> + Send + Sync>;

#[derive(Default, Clone)]
struct Table {
    next_id: i64,
    rows: BTreeMap<RecordId, IndexMap<String, Value>>,
}

#[derive(Default)]
struct Constraints {
    /// (table, column, referenced table)
    foreign_keys: Vec<(String, String, String)>,
    checks: HashMap<String, Vec<RowCheck>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    constraints: Mutex<Constraints>,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let tables = self.tables.lock().unwrap();
        f.debug_struct("MemoryStore")
            .field("tables", &tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Declares a foreign-key constraint checked on insert and update.
    pub fn add_foreign_key(
        &self,
        table: impl Into<String>,
        column: impl Into<String>,
        references: impl Into<String>,
    ) {
        let mut constraints = self.constraints.lock().unwrap();
        constraints
            .foreign_keys
            .push((table.into(), column.into(), references.into()));
    }

    /// Installs a row check evaluated before every insert and update of
    /// `table`, standing in for driver-level validations.
    pub fn add_check(&self, table: impl Into<String>, check: RowCheck) {
        let mut constraints = self.constraints.lock().unwrap();
        constraints.checks.entry(table.into()).or_default().push(check);
    }

    /// Seeds a row outside of any transaction. Test setup only.
    pub fn seed(&self, table: &str, id: RecordId, values: IndexMap<String, Value>) {
        let mut tables = self.tables.lock().unwrap();
        let entry = tables.entry(table.to_owned()).or_default();
        if let RecordId::Int(n) = &id {
            entry.next_id = entry.next_id.max(*n);
        }
        entry.rows.insert(id, values);
    }

    /// Reads a row outside of any transaction. Test assertions only.
    pub fn row(&self, table: &str, id: &RecordId) -> Option<IndexMap<String, Value>> {
        let tables = self.tables.lock().unwrap();
        tables.get(table).and_then(|t| t.rows.get(id)).cloned()
    }

    /// All ids of a table, in primary-key order. Test assertions only.
    pub fn ids(&self, table: &str) -> Vec<RecordId> {
        let tables = self.tables.lock().unwrap();
        tables
            .get(table)
            .map(|t| t.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn validate_row(
        &self,
        working: &HashMap<String, Table>,
        table: &str,
        values: &IndexMap<String, Value>,
    ) -> StoreResult<()> {
        let constraints = self.constraints.lock().unwrap();
        for (fk_table, column, references) in &constraints.foreign_keys {
            if fk_table != table {
                continue;
            }
            let Some(value) = values.get(column) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let Some(id) = RecordId::from_value(value) else {
                return Err(StoreError::ForeignKeyViolation {
                    table: table.to_owned(),
                    message: format!("{column} is not a key"),
                });
            };
            let present = working
                .get(references)
                .is_some_and(|t| t.rows.contains_key(&id));
            if !present {
                return Err(StoreError::ForeignKeyViolation {
                    table: table.to_owned(),
                    message: format!("{column} -> {references}[{id}] does not exist"),
                });
            }
        }
        if let Some(checks) = constraints.checks.get(table) {
            let errors: Vec<(String, String)> =
                checks.iter().flat_map(|check| check(values)).collect();
            if !errors.is_empty() {
                return Err(StoreError::RowValidation {
                    table: table.to_owned(),
                    errors,
                });
            }
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        let tables = self.tables.lock().unwrap();
        Ok(Box::new(MemoryTransaction {
            store: self,
            working: tables.clone(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    working: HashMap<String, Table>,
}

impl MemoryTransaction<'_> {
    fn row_mut(
        &mut self,
        table: &str,
        id: &RecordId,
    ) -> StoreResult<&mut IndexMap<String, Value>> {
        self.working
            .get_mut(table)
            .and_then(|t| t.rows.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_owned(),
                id: id.clone(),
            })
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn find(&mut self, table: &str, id: &RecordId) -> StoreResult<Option<RecordData>> {
        let row = self.working.get(table).and_then(|t| t.rows.get(id));
        Ok(row.map(|values| RecordData {
            table: table.to_owned(),
            id: Some(id.clone()),
            values: values.clone(),
        }))
    }

    fn find_owned(
        &mut self,
        table: &str,
        key_column: &str,
        owner: &RecordId,
    ) -> StoreResult<Vec<RecordData>> {
        let owner_value = owner.to_value();
        let Some(t) = self.working.get(table) else {
            return Ok(vec![]);
        };
        Ok(t.rows
            .iter()
            .filter(|(_, values)| values.get(key_column) == Some(&owner_value))
            .map(|(id, values)| RecordData {
                table: table.to_owned(),
                id: Some(id.clone()),
                values: values.clone(),
            })
            .collect())
    }

    fn insert(&mut self, table: &str, values: &IndexMap<String, Value>) -> StoreResult<RecordId> {
        let mut values = values.clone();
        let chosen = values.shift_remove("id");
        self.store.validate_row(&self.working, table, &values)?;
        let entry = self.working.entry(table.to_owned()).or_default();
        let id = match chosen {
            Some(value) => RecordId::from_value(&value).ok_or_else(|| {
                StoreError::Other(format!("unusable primary key for {table}: {value}"))
            })?,
            None => {
                entry.next_id += 1;
                RecordId::Int(entry.next_id)
            }
        };
        if let RecordId::Int(n) = &id {
            entry.next_id = entry.next_id.max(*n);
        }
        if entry.rows.contains_key(&id) {
            return Err(StoreError::Other(format!(
                "duplicate primary key {table}[{id}]"
            )));
        }
        entry.rows.insert(id.clone(), values);
        Ok(id)
    }

    fn update(
        &mut self,
        table: &str,
        id: &RecordId,
        values: &IndexMap<String, Value>,
        lock: Option<(&str, i64)>,
    ) -> StoreResult<()> {
        let mut merged = self.row_mut(table, id)?.clone();
        for (column, value) in values {
            merged.insert(column.clone(), value.clone());
        }
        if let Some((lock_column, expected)) = lock {
            let current = merged.get(lock_column).and_then(Value::as_i64).unwrap_or(0);
            // The committed row must agree as well, so that of two
            // transactions started from the same snapshot only the first
            // to land wins.
            let committed = {
                let tables = self.store.tables.lock().unwrap();
                tables
                    .get(table)
                    .and_then(|t| t.rows.get(id))
                    .and_then(|row| row.get(lock_column))
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
            };
            if current != expected || committed != expected {
                return Err(StoreError::StaleRecord {
                    table: table.to_owned(),
                    id: id.clone(),
                });
            }
            merged.insert(lock_column.to_owned(), Value::from(expected + 1));
        }
        self.store.validate_row(&self.working, table, &merged)?;
        *self.row_mut(table, id)? = merged;
        Ok(())
    }

    fn delete(&mut self, table: &str, id: &RecordId) -> StoreResult<()> {
        let removed = self
            .working
            .get_mut(table)
            .and_then(|t| t.rows.remove(id));
        if removed.is_none() {
            return Err(StoreError::NotFound {
                table: table.to_owned(),
                id: id.clone(),
            });
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut tables = self.store.tables.lock().unwrap();
        *tables = self.working;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
