//! Backend connections: the low-level primitives the table engine needs,
//! implemented by a relational engine, an embedded document store, and a
//! hosted attribute-value store.
//!
//! Backends are variants selected at construction time (a tagged union
//! behind one capability trait), not an inheritance hierarchy.

pub mod attribute;
pub mod document;
pub mod relational;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::query::{Filter, Query, WriteSet};
use crate::resource::Identity;
use crate::table::TableDef;

/// Outcome of an insert: whether a fresh row was written, the existing row
/// was updated in place (upsert path), or the identity already existed and
/// nothing was written (create path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
    Existed,
}

/// One fetch window's worth of decoded rows. `exhausted` is true when the
/// backend saw fewer raw rows than the requested window, i.e. there is
/// nothing beyond this window.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub rows: Vec<Value>,
    pub exhausted: bool,
}

/// The low-level primitives the table engine builds its operations on.
///
/// Identity versions act as optimistic-concurrency preconditions: a write
/// whose identity carries a version only applies when the stored version
/// still matches, and otherwise behaves as "not found".
#[async_trait]
pub trait Backend: Send + Sync {
    /// Whether this backend can apply aggregation counter updates in the
    /// same transaction as the primary mutation.
    fn supports_aggregation(&self) -> bool;

    /// Fetch exactly one row by identity (version folded into the lookup).
    async fn get(&self, table: &TableDef, identity: &Identity) -> Result<Option<Value>>;

    /// Insert a row. With `update` values, update in place on an identity
    /// conflict (a single atomic statement, not insert-then-catch). Without,
    /// report `Existed` on conflict and write nothing.
    async fn insert(
        &self,
        table: &TableDef,
        item: &Value,
        update: Option<&WriteSet>,
    ) -> Result<InsertOutcome>;

    /// Apply changes to the row matching the identity. Returns the new row
    /// image, or `None` when no row matched (including version mismatch).
    async fn update(
        &self,
        table: &TableDef,
        identity: &Identity,
        changes: &WriteSet,
    ) -> Result<Option<Value>>;

    /// Delete the row matching the identity. Returns whether a row matched.
    async fn delete(&self, table: &TableDef, identity: &Identity) -> Result<bool>;

    /// Fetch up to `limit` rows matching the query's filters and exclusive
    /// `since` bound, sorted by its ordering and direction.
    async fn fetch(&self, table: &TableDef, query: &Query, limit: usize) -> Result<FetchResult>;

    /// Exact count under the same filter semantics as `fetch`.
    async fn count(&self, table: &TableDef, filters: &[(String, Filter)]) -> Result<u64>;

    /// One result per input identity, preserving order, `None` for
    /// unmatched identities, via a single batched query where the backend
    /// supports one.
    async fn batch(&self, table: &TableDef, identities: &[Identity])
        -> Result<Vec<Option<Value>>>;
}

/// A backend selected at construction time.
pub enum BackendHandle {
    Relational(relational::RelationalBackend),
    Document(document::DocumentBackend),
    Attribute(attribute::AttributeBackend),
}

#[async_trait]
impl Backend for BackendHandle {
    fn supports_aggregation(&self) -> bool {
        match self {
            BackendHandle::Relational(b) => b.supports_aggregation(),
            BackendHandle::Document(b) => b.supports_aggregation(),
            BackendHandle::Attribute(b) => b.supports_aggregation(),
        }
    }

    async fn get(&self, table: &TableDef, identity: &Identity) -> Result<Option<Value>> {
        match self {
            BackendHandle::Relational(b) => b.get(table, identity).await,
            BackendHandle::Document(b) => b.get(table, identity).await,
            BackendHandle::Attribute(b) => b.get(table, identity).await,
        }
    }

    async fn insert(
        &self,
        table: &TableDef,
        item: &Value,
        update: Option<&WriteSet>,
    ) -> Result<InsertOutcome> {
        match self {
            BackendHandle::Relational(b) => b.insert(table, item, update).await,
            BackendHandle::Document(b) => b.insert(table, item, update).await,
            BackendHandle::Attribute(b) => b.insert(table, item, update).await,
        }
    }

    async fn update(
        &self,
        table: &TableDef,
        identity: &Identity,
        changes: &WriteSet,
    ) -> Result<Option<Value>> {
        match self {
            BackendHandle::Relational(b) => b.update(table, identity, changes).await,
            BackendHandle::Document(b) => b.update(table, identity, changes).await,
            BackendHandle::Attribute(b) => b.update(table, identity, changes).await,
        }
    }

    async fn delete(&self, table: &TableDef, identity: &Identity) -> Result<bool> {
        match self {
            BackendHandle::Relational(b) => b.delete(table, identity).await,
            BackendHandle::Document(b) => b.delete(table, identity).await,
            BackendHandle::Attribute(b) => b.delete(table, identity).await,
        }
    }

    async fn fetch(&self, table: &TableDef, query: &Query, limit: usize) -> Result<FetchResult> {
        match self {
            BackendHandle::Relational(b) => b.fetch(table, query, limit).await,
            BackendHandle::Document(b) => b.fetch(table, query, limit).await,
            BackendHandle::Attribute(b) => b.fetch(table, query, limit).await,
        }
    }

    async fn count(&self, table: &TableDef, filters: &[(String, Filter)]) -> Result<u64> {
        match self {
            BackendHandle::Relational(b) => b.count(table, filters).await,
            BackendHandle::Document(b) => b.count(table, filters).await,
            BackendHandle::Attribute(b) => b.count(table, filters).await,
        }
    }

    async fn batch(
        &self,
        table: &TableDef,
        identities: &[Identity],
    ) -> Result<Vec<Option<Value>>> {
        match self {
            BackendHandle::Relational(b) => b.batch(table, identities).await,
            BackendHandle::Document(b) => b.batch(table, identities).await,
            BackendHandle::Attribute(b) => b.batch(table, identities).await,
        }
    }
}

/// Where a table URI points. Relational deployments are configured
/// structurally (connection pool credentials) rather than by URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLocation {
    /// `file://<path>`: an embedded single-file document store.
    Document { path: String },
    /// `arn:aws:sdb:<region>:<account>:domain/<name>`: a hosted
    /// attribute-value store domain.
    Attribute { region: String, domain: String },
}

/// Parse a table URI into the backend it selects.
pub fn resolve_table_uri(uri: &str) -> Result<TableLocation> {
    if let Some(path) = uri.strip_prefix("file://") {
        if path.is_empty() {
            return Err(QueryError::InvalidUri(uri.to_string()).into());
        }
        return Ok(TableLocation::Document {
            path: path.to_string(),
        });
    }
    if uri.starts_with("arn:aws:sdb:") {
        let parts: Vec<&str> = uri.splitn(6, ':').collect();
        if parts.len() == 6 {
            let region = parts[3];
            if let Some(domain) = parts[5].strip_prefix("domain/") {
                if !region.is_empty() && !domain.is_empty() {
                    return Ok(TableLocation::Attribute {
                        region: region.to_string(),
                        domain: domain.to_string(),
                    });
                }
            }
        }
        return Err(QueryError::InvalidUri(uri.to_string()).into());
    }
    Err(QueryError::InvalidUri(uri.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_file_uri() {
        assert_eq!(
            resolve_table_uri("file:///var/data/app.db").unwrap(),
            TableLocation::Document {
                path: "/var/data/app.db".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_attribute_arn() {
        assert_eq!(
            resolve_table_uri("arn:aws:sdb:us-east-1:123456789012:domain/Contacts").unwrap(),
            TableLocation::Attribute {
                region: "us-east-1".to_string(),
                domain: "Contacts".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_rejects_malformed_uris() {
        assert!(resolve_table_uri("file://").is_err());
        assert!(resolve_table_uri("arn:aws:sdb:us-east-1:1:notadomain").is_err());
        assert!(resolve_table_uri("arn:aws:s3:::bucket").is_err());
        assert!(resolve_table_uri("postgres://localhost/db").is_err());
    }
}
