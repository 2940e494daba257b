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

//! Viewtree exposes relational-record aggregates as versioned, JSON-shaped
//! views, and deserializes edited view trees back onto the records: moves
//! between parents, functional collection edits, ordered lists,
//! polymorphic targets, shared references, schema migrations, and access
//! control.

#![deny(unused_must_use)]
#![allow(missing_docs)]

pub mod access;
pub mod change;
pub mod dag_walk;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod executor;
pub mod memory_store;
pub mod migration;
pub mod parser;
pub mod plan;
pub mod positions;
pub mod record;
pub mod reference;
pub mod registry;
pub mod release_pool;
pub mod serializer;
pub mod store;
pub mod update_data;
pub mod value;
pub mod viewmodel;
pub mod visitor;
pub mod wire;
