//! The Model engine: a table definition bound to a backend, exposing the
//! CRUD, pagination, and counting operations with uniform error semantics
//! across backends.
//!
//! Version preconditions ride on [`Identity`]: operations addressed by an
//! identity carrying a version only see the row if the stored version still
//! matches, and otherwise report `NotFound`.

use std::sync::Arc;

use serde_json::Value;

use crate::backend::{Backend, BackendHandle, InsertOutcome};
use crate::error::{Error, QueryError, Result};
use crate::pagination::{self, Scan};
use crate::query::{Filter, Page, Query, WriteSet, WriteValue, has_empty_membership};
use crate::resource::{FieldKind, Identity};
use crate::table::{TableDef, TableState};

pub struct Model {
    table: TableDef,
    backend: Arc<BackendHandle>,
}

impl Model {
    /// Bind a table definition to a backend. Tables with aggregation rules
    /// are rejected here when the backend cannot apply counter updates
    /// atomically with the primary mutation.
    pub fn new(table: TableDef, backend: Arc<BackendHandle>) -> Result<Self> {
        if !table.aggregations().is_empty() && !backend.supports_aggregation() {
            return Err(QueryError::AggregationUnsupported {
                table: table.storage_name().to_string(),
            }
            .into());
        }
        Ok(Self { table, backend })
    }

    pub fn table(&self) -> &TableDef {
        &self.table
    }

    /// Declarative schema description for diffing tooling.
    pub fn state(&self) -> TableState {
        self.table.state()
    }

    fn not_found(&self) -> Error {
        Error::NotFound {
            table: self.table.storage_name().to_string(),
        }
    }

    fn precondition(&self) -> Error {
        Error::Precondition {
            table: self.table.storage_name().to_string(),
        }
    }

    /// Reject write sets that touch identity-key attributes, address joined
    /// sub-resources (read-only), or carry values of the wrong type.
    fn check_writable(&self, changes: &WriteSet) -> Result<()> {
        for (name, change) in changes {
            if self
                .table
                .resource()
                .identity_keys()
                .iter()
                .any(|key| key == name)
            {
                return Err(QueryError::IdentityKeyWrite(name.clone()).into());
            }
            // Attribute existence and value types are checked up front;
            // unknown attributes must fail before any backend round trip.
            // Writes address the base table only, so a join-qualified name
            // is unknown here.
            let kind = match self.table.resource().field(name) {
                Some(field) => field.kind,
                None => {
                    return Err(QueryError::UnknownColumn {
                        table: self.table.storage_name().to_string(),
                        column: name.clone(),
                    }
                    .into());
                }
            };
            match change {
                WriteValue::Set(value) => {
                    if !value.is_null() {
                        let field = crate::resource::Field {
                            kind,
                            required: false,
                        };
                        if !field.accepts(value) {
                            return Err(Error::Validation {
                                resource: self.table.resource().name().to_string(),
                                errors: vec![format!(
                                    "attribute '{name}' expected {kind:?}, got {value}"
                                )],
                            });
                        }
                    }
                }
                WriteValue::Increment(_) => {
                    if kind != FieldKind::Integer {
                        return Err(QueryError::TypeMismatch {
                            column: name.clone(),
                            kind,
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch the record matching the identity.
    pub async fn retrieve(&self, identity: &Identity) -> Result<Value> {
        self.backend
            .get(&self.table, identity)
            .await?
            .ok_or_else(|| self.not_found())
    }

    /// Insert a new record. An already-existing identity is a precondition
    /// failure.
    pub async fn create(&self, item: &Value) -> Result<Value> {
        self.table.resource().validate(item)?;
        match self.backend.insert(&self.table, item, None).await? {
            InsertOutcome::Inserted => Ok(item.clone()),
            _ => Err(self.precondition()),
        }
    }

    /// Replace the full record matching the identity with `item`. The item's
    /// identity-key values must equal the addressed identity's.
    pub async fn replace(&self, identity: &Identity, item: &Value) -> Result<Value> {
        self.table.resource().validate(item)?;
        for (name, value) in &identity.keys {
            if item.get(name) != Some(value) {
                return Err(QueryError::IdentityKeyWrite(name.clone()).into());
            }
        }

        // Full image: every non-identity attribute is written, absent
        // optional attributes explicitly nulled out.
        let changes: WriteSet = self
            .table
            .resource()
            .fields()
            .iter()
            .filter(|(name, _)| {
                !self
                    .table
                    .resource()
                    .identity_keys()
                    .iter()
                    .any(|key| key == name)
            })
            .map(|(name, _)| {
                let value = item.get(name).cloned().unwrap_or(Value::Null);
                (name.clone(), WriteValue::Set(value))
            })
            .collect();

        self.backend
            .update(&self.table, identity, &changes)
            .await?
            .ok_or_else(|| self.not_found())
    }

    /// Apply a partial write set to the record matching the identity.
    /// Returns the new record image.
    pub async fn update(&self, identity: &Identity, changes: &WriteSet) -> Result<Value> {
        self.check_writable(changes)?;
        self.backend
            .update(&self.table, identity, changes)
            .await?
            .ok_or_else(|| self.not_found())
    }

    /// Insert `item`, or apply `on_conflict` to the existing record when the
    /// identity is already taken. One atomic backend operation.
    pub async fn upsert(&self, item: &Value, on_conflict: &WriteSet) -> Result<InsertOutcome> {
        self.table.resource().validate(item)?;
        self.check_writable(on_conflict)?;
        match self
            .backend
            .insert(&self.table, item, Some(on_conflict))
            .await?
        {
            // `Existed` here means a conditional write lost a race; the
            // caller may retry.
            InsertOutcome::Existed => Err(self.precondition()),
            outcome => Ok(outcome),
        }
    }

    /// Delete the record matching the identity.
    pub async fn destroy(&self, identity: &Identity) -> Result<()> {
        if self.backend.delete(&self.table, identity).await? {
            Ok(())
        } else {
            Err(self.not_found())
        }
    }

    /// Fetch one page of records. A query with an empty membership filter
    /// short-circuits to an empty page without a backend round trip.
    pub async fn list(&self, query: &Query) -> Result<Page> {
        if has_empty_membership(&query.filters) {
            return Ok(Page {
                results: Vec::new(),
                next: None,
            });
        }
        pagination::list(self.backend.as_ref(), &self.table, query).await
    }

    /// A pull-based batch sequence over every record the query matches.
    pub fn scan(&self, query: Query) -> Scan<'_> {
        Scan::new(self.backend.as_ref(), &self.table, query)
    }

    /// Exact count of records matching the filters. Full-scan cost on every
    /// backend; intended for administrative use, not hot paths.
    pub async fn count(&self, filters: &[(String, Filter)]) -> Result<u64> {
        if has_empty_membership(filters) {
            return Ok(0);
        }
        self.backend.count(&self.table, filters).await
    }

    /// One result per input identity, preserving order, `None` for misses.
    pub async fn batch_retrieve(&self, identities: &[Identity]) -> Result<Vec<Option<Value>>> {
        if identities.is_empty() {
            return Ok(Vec::new());
        }
        self.backend.batch(&self.table, identities).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::attribute::{AttributeBackend, InMemoryAttributeApi};
    use crate::backend::document::{DocumentBackend, DocumentRegistry};
    use crate::query::Filter;
    use crate::resource::{Field, Resource};
    use crate::table::{AggregateOp, Aggregation};
    use serde_json::json;
    use tempfile::TempDir;

    fn contacts_table() -> TableDef {
        let resource = Resource::builder("contact")
            .field("id", Field::string())
            .field("version", Field::integer())
            .field("name", Field::string())
            .field("age", Field::integer().optional())
            .identity_key("id")
            .version_key("version")
            .build()
            .unwrap();
        TableDef::new("contacts", resource)
    }

    fn document_model(dir: &TempDir, table: TableDef) -> Model {
        let registry = DocumentRegistry::new();
        let store = registry.open(dir.path().join("model.db")).unwrap();
        let backend = Arc::new(BackendHandle::Document(DocumentBackend::new(store)));
        Model::new(table, backend).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_duplicate_is_precondition_failure() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        let item = json!({"id": "a", "version": 1, "name": "x"});

        model.create(&item).await.unwrap();
        let err = model.create(&item).await.unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_item() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        let err = model
            .create(&json!({"id": "a", "version": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_stale_version_reads_as_not_found() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        model
            .create(&json!({"id": "a", "version": 1, "name": "x"}))
            .await
            .unwrap();

        let current = Identity::new([("id", json!("a"))]).with_version("version", json!(1));
        model
            .update(
                &current,
                &vec![
                    ("name".to_string(), WriteValue::Set(json!("y"))),
                    ("version".to_string(), WriteValue::Set(json!(2))),
                ],
            )
            .await
            .unwrap();

        // The old version no longer matches anything.
        let err = model.retrieve(&current).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let row = model
            .retrieve(&Identity::new([("id", json!("a"))]))
            .await
            .unwrap();
        assert_eq!(row["version"], 2);
        assert_eq!(row["name"], "y");
    }

    #[tokio::test]
    async fn test_update_rejects_identity_key_writes() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        let err = model
            .update(
                &Identity::new([("id", json!("a"))]),
                &vec![("id".to_string(), WriteValue::Set(json!("b")))],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::IdentityKeyWrite(_))
        ));
    }

    #[tokio::test]
    async fn test_increment_rejected_on_non_integer_column() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        let err = model
            .update(
                &Identity::new([("id", json!("a"))]),
                &vec![("name".to_string(), WriteValue::Increment(1))],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::TypeMismatch {
                column,
                kind: FieldKind::String,
            }) if column == "name"
        ));
    }

    #[tokio::test]
    async fn test_update_rejects_qualified_attribute_names() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        let err = model
            .update(
                &Identity::new([("id", json!("a"))]),
                &vec![("org.title".to_string(), WriteValue::Set(json!("boss")))],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::UnknownColumn { column, .. }) if column == "org.title"
        ));
    }

    #[tokio::test]
    async fn test_replace_writes_full_image() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        model
            .create(&json!({"id": "a", "version": 1, "name": "x", "age": 30}))
            .await
            .unwrap();

        // The replacement omits age: it must be nulled, not preserved.
        let replaced = model
            .replace(
                &Identity::new([("id", json!("a"))]),
                &json!({"id": "a", "version": 2, "name": "y"}),
            )
            .await
            .unwrap();
        assert_eq!(replaced["name"], "y");
        assert_eq!(replaced["version"], 2);
        assert_eq!(replaced.get("age"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_replace_identity_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        let err = model
            .replace(
                &Identity::new([("id", json!("a"))]),
                &json!({"id": "b", "version": 1, "name": "x"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::IdentityKeyWrite(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_missing_row_is_not_found() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        let err = model
            .destroy(&Identity::new([("id", json!("nope"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_membership_short_circuits() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        model
            .create(&json!({"id": "a", "version": 1, "name": "x"}))
            .await
            .unwrap();

        let query = Query::new("id").filter("name", Filter::In(vec![]));
        let page = model.list(&query).await.unwrap();
        assert!(page.results.is_empty());
        assert_eq!(page.next, None);

        let count = model
            .count(&[("name".to_string(), Filter::In(vec![]))])
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_batch_retrieve_preserves_order_with_misses() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        for id in ["a", "b"] {
            model
                .create(&json!({"id": id, "version": 1, "name": id}))
                .await
                .unwrap();
        }

        let results = model
            .batch_retrieve(&[
                Identity::new([("id", json!("b"))]),
                Identity::new([("id", json!("missing"))]),
                Identity::new([("id", json!("a"))]),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap()["id"], "b");
        assert!(results[1].is_none());
        assert_eq!(results[2].as_ref().unwrap()["id"], "a");
    }

    #[tokio::test]
    async fn test_aggregations_rejected_on_attribute_backend() {
        let table = contacts_table().aggregate(Aggregation {
            target: "orgs".to_string(),
            op: AggregateOp::Count,
            field: "contact_count".to_string(),
            key: vec![("id".to_string(), "id".to_string())],
            filter: vec![],
        });
        let backend = Arc::new(BackendHandle::Attribute(AttributeBackend::new(
            Arc::new(InMemoryAttributeApi::new()),
            "Contacts",
        )));
        assert!(matches!(
            Model::new(table, backend),
            Err(Error::Query(QueryError::AggregationUnsupported { .. }))
        ));
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let dir = TempDir::new().unwrap();
        let model = document_model(&dir, contacts_table());
        let item = json!({"id": "a", "version": 1, "name": "x", "age": 1});
        let on_conflict = vec![("age".to_string(), WriteValue::Increment(1))];

        let outcome = model.upsert(&item, &on_conflict).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        let outcome = model.upsert(&item, &on_conflict).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Updated);

        let row = model
            .retrieve(&Identity::new([("id", json!("a"))]))
            .await
            .unwrap();
        assert_eq!(row["age"], 2);
    }
}
