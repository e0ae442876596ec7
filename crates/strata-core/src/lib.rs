//! strata — a storage-agnostic table engine with optimistic concurrency,
//! cursor pagination, and incrementally maintained aggregation counters.
//!
//! A [`Resource`] describes a record's typed attributes, identity key(s),
//! and optional version attribute. A [`TableDef`] binds the resource to
//! backend storage and layers on secondary indexes, legacy-row defaults,
//! nested-resource joins, and aggregation rules. A [`Model`] binds the table
//! to one of three backends — Postgres, an embedded single-file document
//! store, or a hosted attribute-value store — and exposes the same CRUD,
//! pagination, and counting operations over each.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use strata_core::{
//!     BackendHandle, Field, Identity, Model, Query, Resource, TableDef,
//!     backend::document::{DocumentBackend, DocumentRegistry},
//! };
//!
//! # async fn run() -> strata_core::Result<()> {
//! let resource = Resource::builder("contact")
//!     .field("id", Field::string())
//!     .field("version", Field::integer())
//!     .field("name", Field::string())
//!     .identity_key("id")
//!     .version_key("version")
//!     .build()?;
//! let table = TableDef::new("contacts", resource).index(&["name"])?;
//!
//! let registry = DocumentRegistry::new();
//! let store = registry.open("/var/data/app.db")?;
//! let backend = Arc::new(BackendHandle::Document(DocumentBackend::new(store)));
//! let contacts = Model::new(table, backend)?;
//!
//! contacts
//!     .create(&json!({"id": "a", "version": 1, "name": "Ada"}))
//!     .await?;
//!
//! // Version-checked read: NotFound once the stored version moves on.
//! let current = Identity::new([("id", json!("a"))]).with_version("version", json!(1));
//! let row = contacts.retrieve(&current).await?;
//! assert_eq!(row["name"], "Ada");
//!
//! let page = contacts.list(&Query::new("name")).await?;
//! assert_eq!(page.results.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod model;
pub mod pagination;
pub mod query;
pub mod resource;
pub mod sql;
pub mod table;

pub use backend::{
    Backend, BackendHandle, FetchResult, InsertOutcome, TableLocation, resolve_table_uri,
};
pub use error::{BackendError, Error, QueryError, Result};
pub use model::Model;
pub use pagination::Scan;
pub use query::{
    DEFAULT_FETCH_SIZE, Direction, Filter, Page, Query, WriteSet, WriteValue, compare_values,
};
pub use resource::{Field, FieldKind, Identity, Resource};
pub use table::{AggregateOp, Aggregation, AggregationUpdate, Join, TableDef, TableState};
