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

//! Request-boundary errors.
//!
//! Every subsystem raises its own error type next to the code that fails;
//! this module folds them into one [`Error`] and renders the wire-facing
//! envelope with the stable code strings and HTTP-equivalent statuses.

use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use thiserror::Error;

use crate::access::AccessError;
use crate::descriptor::DescriptorError;
use crate::executor::ExecuteError;
use crate::migration::MigrationError;
use crate::parser::ParseError;
use crate::plan::PlanError;
use crate::record::RecordId;
use crate::reference::Reference;
use crate::reference::ViewName;
use crate::registry::RegistryError;
use crate::serializer::SerializeError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A viewmodel an error blames, as it appears in the envelope's `nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlameNode {
    #[serde(rename = "type")]
    pub view: ViewName,
    pub id: Option<RecordId>,
}

impl From<&Reference> for BlameNode {
    fn from(reference: &Reference) -> Self {
        BlameNode {
            view: reference.view.clone(),
            id: reference.id.clone(),
        }
    }
}

/// The wire error shape: HTTP-equivalent status, stable code, human
/// detail, machine-readable meta, and the blamed viewmodels.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub status: u16,
    pub code: String,
    pub detail: String,
    pub meta: Value,
    pub nodes: Vec<BlameNode>,
}

impl ErrorEnvelope {
    fn new(status: u16, code: &str, detail: String) -> Self {
        ErrorEnvelope {
            status,
            code: code.to_owned(),
            detail,
            meta: json!({}),
            nodes: vec![],
        }
    }

    fn meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    fn blame(mut self, reference: &Reference) -> Self {
        self.nodes.push(reference.into());
        self
    }
}

impl Error {
    pub fn envelope(&self) -> ErrorEnvelope {
        let detail = self.to_string();
        match self {
            Error::Registry(err) => registry_envelope(err, detail),
            Error::Descriptor(_) => ErrorEnvelope::new(500, "InvalidStructure", detail),
            Error::Migration(err) => match err {
                MigrationError::NoPath { view, from, to } => {
                    ErrorEnvelope::new(400, "Migration.NoPath", detail)
                        .meta(json!({"viewmodel": view, "from": from, "to": to}))
                }
                MigrationError::MigrationsIncomplete { view, version } => {
                    ErrorEnvelope::new(400, "Migration.MigrationsIncomplete", detail)
                        .meta(json!({"viewmodel": view, "version": version}))
                }
                MigrationError::OneWay { view, from, to } => {
                    ErrorEnvelope::new(400, "Migration.OneWay", detail)
                        .meta(json!({"viewmodel": view, "from": from, "to": to}))
                }
                MigrationError::Transform { view, .. } => {
                    ErrorEnvelope::new(500, "Migration.Error", detail)
                        .meta(json!({"viewmodel": view}))
                }
                MigrationError::InvalidVersion { view } => {
                    ErrorEnvelope::new(400, "SchemaVersionMismatch", detail)
                        .meta(json!({"viewmodel": view}))
                }
                MigrationError::Registry(err) => registry_envelope(err, detail),
            },
            Error::Parse(err) => parse_envelope(err, detail),
            Error::Plan(err) => plan_envelope(err, detail),
            Error::Execute(err) => execute_envelope(err, detail),
            Error::Serialize(err) => match err {
                SerializeError::Permissions { node, .. } => {
                    ErrorEnvelope::new(403, "Serialization.Permissions", detail).blame(node)
                }
                SerializeError::NotFound { node } => {
                    ErrorEnvelope::new(404, "NotFound", detail)
                        .meta(json!({"viewmodel": node.view, "id": node.id}))
                        .blame(node)
                }
                SerializeError::Registry(err) => registry_envelope(err, detail),
                SerializeError::Store(_) => ErrorEnvelope::new(500, "Serialization", detail),
            },
            Error::Store(_) => ErrorEnvelope::new(500, "DeserializationError", detail),
        }
    }
}

fn registry_envelope(err: &RegistryError, detail: String) -> ErrorEnvelope {
    match err {
        RegistryError::UnknownView(view) => ErrorEnvelope::new(400, "UnknownView", detail)
            .meta(json!({"viewmodel": view})),
        RegistryError::DuplicateView(view) => ErrorEnvelope::new(500, "DuplicateView", detail)
            .meta(json!({"viewmodel": view})),
    }
}

fn parse_envelope(err: &ParseError, detail: String) -> ErrorEnvelope {
    match err {
        ParseError::InvalidStructure { .. }
        | ParseError::NonRootType(_)
        | ParseError::InvalidId { .. } => ErrorEnvelope::new(400, "InvalidStructure", detail),
        ParseError::SchemaVersionMismatch { view, version } => {
            ErrorEnvelope::new(400, "SchemaVersionMismatch", detail)
                .meta(json!({"viewmodel": view, "version": version}))
        }
        ParseError::UnknownAttribute { view, attribute } => {
            ErrorEnvelope::new(400, "UnknownAttribute", detail)
                .meta(json!({"viewmodel": view, "attribute": attribute}))
        }
        ParseError::Validation {
            view, attribute, ..
        } => ErrorEnvelope::new(400, "Validation", detail)
            .meta(json!({"viewmodel": view, "attribute": attribute})),
        ParseError::ReadOnlyAttribute { view, attribute } => {
            ErrorEnvelope::new(400, "ReadOnlyAttribute", detail)
                .meta(json!({"viewmodel": view, "attribute": attribute}))
        }
        ParseError::InvalidAttributeType {
            view,
            attribute,
            expected,
            provided,
        } => ErrorEnvelope::new(400, "InvalidAttributeType", detail).meta(json!({
            "viewmodel": view,
            "attribute": attribute,
            "expected": expected,
            "provided": provided,
        })),
        ParseError::TypeMismatch { view, association, provided } => {
            ErrorEnvelope::new(400, "TypeMismatch", detail).meta(json!({
                "viewmodel": view,
                "association": association,
                "provided": provided,
            }))
        }
        ParseError::DuplicateRoot(reference) => {
            ErrorEnvelope::new(400, "DuplicateRoot", detail).blame(reference)
        }
        ParseError::DuplicateReference { reference, .. } => {
            ErrorEnvelope::new(400, "DuplicateReference", detail).blame(reference)
        }
        ParseError::UnresolvedReference(key) => {
            ErrorEnvelope::new(400, "UnresolvedReference", detail).meta(json!({"key": key}))
        }
        ParseError::UnusedReference(key) => {
            ErrorEnvelope::new(400, "UnusedReference", detail).meta(json!({"key": key}))
        }
        ParseError::Registry(err) => registry_envelope(err, detail),
    }
}

fn plan_envelope(err: &PlanError, detail: String) -> ErrorEnvelope {
    match err {
        PlanError::NotFound { view, id, detail: kind } => {
            let status = if kind == "no such record" { 404 } else { 400 };
            ErrorEnvelope::new(status, "NotFound", detail)
                .meta(json!({"viewmodel": view, "id": id}))
        }
        PlanError::TypeMismatch {
            owner,
            association,
            provided,
        } => ErrorEnvelope::new(400, "TypeMismatch", detail).meta(json!({
            "viewmodel": owner,
            "association": association,
            "provided": provided,
        })),
        PlanError::DuplicateReference { reference } => {
            ErrorEnvelope::new(400, "DuplicateReference", detail).blame(reference)
        }
        PlanError::DuplicateNode { reference } => {
            ErrorEnvelope::new(400, "InvalidStructure", detail).blame(reference)
        }
        PlanError::DuplicateRoot { reference } => {
            ErrorEnvelope::new(400, "DuplicateRoot", detail).blame(reference)
        }
        PlanError::ReadOnlyAttribute { view, attribute } => {
            ErrorEnvelope::new(400, "ReadOnlyAttribute", detail)
                .meta(json!({"viewmodel": view, "attribute": attribute}))
        }
        PlanError::Store(_) => ErrorEnvelope::new(500, "DeserializationError", detail),
        PlanError::Registry(err) => registry_envelope(err, detail),
    }
}

fn execute_envelope(err: &ExecuteError, detail: String) -> ErrorEnvelope {
    match err {
        ExecuteError::Access(access) => match access {
            AccessError::Visibility { node, .. } => {
                ErrorEnvelope::new(403, "Permissions.Visibility", detail).blame(node)
            }
            AccessError::Editability { node, .. } | AccessError::InvalidEdit { node, .. } => {
                ErrorEnvelope::new(403, "Permissions.Editability", detail).blame(node)
            }
            AccessError::OutsideRootContext { view } => {
                ErrorEnvelope::new(500, "InvalidStructure", detail)
                    .meta(json!({"viewmodel": view}))
            }
        },
        ExecuteError::Callback(callback) => ErrorEnvelope::new(400, "Validation", detail)
            .meta(json!({"callback": callback.callback})),
        ExecuteError::Validation { node, errors } => {
            let attributes: serde_json::Map<String, Value> = errors
                .iter()
                .map(|(attribute, message)| (attribute.clone(), json!([message])))
                .collect();
            ErrorEnvelope::new(400, "Validation", detail)
                .meta(json!({"attributes": attributes}))
                .blame(node)
        }
        ExecuteError::LockFailure { node } => {
            ErrorEnvelope::new(409, "LockFailure", detail)
                .meta(json!({"viewmodel": node.view, "id": node.id}))
                .blame(node)
        }
        ExecuteError::Save { node, .. } => {
            ErrorEnvelope::new(400, "DeserializationError", detail).blame(node)
        }
        ExecuteError::Cycle { node } => {
            ErrorEnvelope::new(400, "Cycle", detail).blame(node)
        }
        ExecuteError::Store(_) => ErrorEnvelope::new(500, "DeserializationError", detail),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_not_found_in_collection_is_a_bad_request() {
        let err = Error::Plan(PlanError::NotFound {
            view: ViewName::new("Child"),
            id: RecordId::Int(999),
            detail: "not in the collection".to_owned(),
        });
        let envelope = err.envelope();
        assert_eq!(envelope.status, 400);
        assert_eq!(envelope.code, "NotFound");
        assert_eq!(envelope.meta["viewmodel"], json!("Child"));
        assert_eq!(envelope.meta["id"], json!(999));
    }

    #[test]
    fn test_missing_root_record_is_404() {
        let err = Error::Plan(PlanError::NotFound {
            view: ViewName::new("Parent"),
            id: RecordId::Int(1),
            detail: "no such record".to_owned(),
        });
        assert_eq!(err.envelope().status, 404);
    }

    #[test]
    fn test_lock_failure_envelope() {
        let node = Reference::persisted("Parent".into(), RecordId::Int(3));
        let err = Error::Execute(ExecuteError::LockFailure { node: node.clone() });
        let envelope = err.envelope();
        assert_eq!(envelope.status, 409);
        assert_eq!(envelope.code, "LockFailure");
        assert_eq!(envelope.nodes, vec![BlameNode::from(&node)]);
    }

    #[test]
    fn test_validation_meta_aggregates_per_attribute() {
        let node = Reference::persisted("Child".into(), RecordId::Int(1));
        let err = Error::Execute(ExecuteError::Validation {
            node,
            errors: vec![("name".to_owned(), "must be present".to_owned())],
        });
        let envelope = err.envelope();
        assert_eq!(envelope.code, "Validation");
        assert_eq!(envelope.meta["attributes"]["name"], json!(["must be present"]));
    }

    #[test]
    fn test_migration_codes() {
        let err = Error::Migration(MigrationError::OneWay {
            view: ViewName::new("Doc"),
            from: 1,
            to: 2,
        });
        assert_eq!(err.envelope().code, "Migration.OneWay");
        assert_matches!(err, Error::Migration(_));
    }
}
