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

//! The storage interface.
//!
//! The engine never generates SQL; it talks to the relational store through
//! these two object-safe traits. Drivers are expected to provide row-level
//! identity, foreign keys, transactions, and optimistic locking on a version
//! column where a table declares one.

use std::fmt::Debug;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::record::RecordData;
use crate::record::RecordId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {table}[{id}] not found")]
    NotFound { table: String, id: RecordId },
    #[error("stale record {table}[{id}]")]
    StaleRecord { table: String, id: RecordId },
    #[error("foreign key violation on {table}: {message}")]
    ForeignKeyViolation { table: String, message: String },
    #[error("row validation failed on {table}")]
    RowValidation {
        table: String,
        /// Per-column failure messages.
        errors: Vec<(String, String)>,
    },
    #[error("store error: {0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle on the underlying relational store.
pub trait Store: Send + Sync + Debug {
    /// Opens a transaction. All reads and writes of one request happen
    /// through a single transaction.
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>>;
}

/// One open transaction. Dropping without `commit` must discard all writes.
pub trait StoreTransaction {
    fn find(&mut self, table: &str, id: &RecordId) -> StoreResult<Option<RecordData>>;

    /// Rows whose `key_column` equals `owner`, in primary-key order.
    fn find_owned(
        &mut self,
        table: &str,
        key_column: &str,
        owner: &RecordId,
    ) -> StoreResult<Vec<RecordData>>;

    /// Inserts a row and returns its identity. A caller-chosen primary key is
    /// passed as an `id` column value.
    fn insert(&mut self, table: &str, values: &IndexMap<String, Value>) -> StoreResult<RecordId>;

    /// Writes the given columns of an existing row. When `lock` is present,
    /// the named version column must still hold the expected value; the
    /// store increments it as part of the write, or fails with
    /// [`StoreError::StaleRecord`].
    fn update(
        &mut self,
        table: &str,
        id: &RecordId,
        values: &IndexMap<String, Value>,
        lock: Option<(&str, i64)>,
    ) -> StoreResult<()>;

    fn delete(&mut self, table: &str, id: &RecordId) -> StoreResult<()>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>) -> StoreResult<()>;
}
