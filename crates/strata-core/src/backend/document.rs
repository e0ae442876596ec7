//! Embedded single-file document store.
//!
//! File-backed and process-local: the whole store is held in memory and
//! rewritten (MessagePack-encoded) on every mutation. Identity uniqueness is
//! enforced through a derived composite key — the identity attribute values
//! joined into one indexed string — in addition to the store's native row
//! id. Optimistic concurrency and pagination are implemented over plain
//! filter/sort/limit primitives since there is no SQL layer underneath.
//!
//! A process-wide [`DocumentRegistry`] keyed by canonical path prevents
//! opening the same on-disk file multiple times concurrently. Lifecycle is
//! explicit: `open` and `close`, no implicit module-level state.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{Backend, FetchResult, InsertOutcome};
use crate::error::{BackendError, Result};
use crate::query::{Filter, Query, WriteSet, apply_write_set};
use crate::resource::Identity;
use crate::table::TableDef;

/// A row with its store-native id alongside the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    row_id: u64,
    doc: Value,
}

/// The on-disk shape: every table's rows keyed by composite identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    next_row_id: u64,
    tables: BTreeMap<String, BTreeMap<String, StoredRow>>,
}

/// One open store file. All mutations hold the write lock for the duration
/// of the operation, which is what makes same-store aggregation counter
/// updates atomic with the primary mutation.
pub struct DocumentStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl DocumentStore {
    fn load(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let bytes = fs::read(&path).map_err(BackendError::Io)?;
            rmp_serde::from_slice(&bytes).map_err(|e| BackendError::CorruptedStore {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            StoreData::default()
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Rewrite the store file from the given state. Writes to a sibling
    /// temp file first so a crash mid-write never truncates the store.
    fn persist(&self, data: &StoreData) -> Result<()> {
        let bytes = rmp_serde::to_vec(data).map_err(|e| BackendError::CorruptedStore {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(BackendError::Io)?;
        fs::rename(&tmp, &self.path).map_err(BackendError::Io)?;
        Ok(())
    }
}

/// Canonical registry key. The file itself may not exist yet, so the parent
/// directory is canonicalized and the file name appended.
fn canonical_key(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Explicit registry of open stores, keyed by canonical path.
pub struct DocumentRegistry {
    stores: Mutex<HashMap<PathBuf, Arc<DocumentStore>>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or return the already-open handle for) the store at `path`.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Arc<DocumentStore>> {
        let key = canonical_key(path.as_ref());
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(&key) {
            return Ok(Arc::clone(store));
        }
        debug!(path = %key.display(), "opening document store");
        let store = Arc::new(DocumentStore::load(key.clone())?);
        stores.insert(key, Arc::clone(&store));
        Ok(store)
    }

    /// Drop the registry's handle for `path`. Returns whether a handle was
    /// held. Backends already constructed keep their own `Arc`.
    pub fn close(&self, path: impl AsRef<Path>) -> bool {
        let key = canonical_key(path.as_ref());
        self.stores.lock().remove(&key).is_some()
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend over one open document store.
pub struct DocumentBackend {
    store: Arc<DocumentStore>,
}

impl DocumentBackend {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

/// Apply aggregation counter adjustments for a mutation, within the same
/// store lock as the primary write. Aggregation targets must live in the
/// same store file. A missing target row is skipped: SQL backends behave
/// the same way (an UPDATE of an absent row is a no-op).
fn apply_aggregations(
    data: &mut StoreData,
    table: &TableDef,
    old: Option<&Value>,
    new: Option<&Value>,
) {
    for update in table.aggregation_deltas(old, new) {
        let composite = composite_of(&update.key);
        let target = data.tables.entry(update.target.clone()).or_default();
        match target.get_mut(&composite) {
            Some(row) => {
                let current = row.doc.get(&update.field).and_then(Value::as_i64).unwrap_or(0);
                if let Some(obj) = row.doc.as_object_mut() {
                    obj.insert(update.field.clone(), Value::from(current + update.delta));
                }
            }
            None => {
                warn!(
                    target_table = %update.target,
                    "aggregation target row missing; counter update skipped"
                );
            }
        }
    }
}

/// Composite key from already-extracted identity values. Matches the
/// encoding [`Identity::composite`] produces for scalar fields.
fn composite_of(values: &[(String, Value)]) -> String {
    values
        .iter()
        .map(|(_, v)| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

#[async_trait]
impl Backend for DocumentBackend {
    fn supports_aggregation(&self) -> bool {
        true
    }

    async fn get(&self, table: &TableDef, identity: &Identity) -> Result<Option<Value>> {
        let data = self.store.data.read();
        let row = data
            .tables
            .get(table.storage_name())
            .and_then(|rows| rows.get(&identity.composite(table.resource())));
        Ok(row
            .filter(|r| identity.matches(&r.doc))
            .and_then(|r| table.finalize_row(r.doc.clone())))
    }

    async fn insert(
        &self,
        table: &TableDef,
        item: &Value,
        update: Option<&WriteSet>,
    ) -> Result<InsertOutcome> {
        let identity = table.resource().identity_of(item)?;
        let composite = identity.composite(table.resource());

        let mut data = self.store.data.write();
        // Mutations are staged on a copy and swapped in only after the file
        // write succeeds, so a failed persist leaves memory matching disk.
        let mut staged = data.clone();
        let rows = staged
            .tables
            .entry(table.storage_name().to_string())
            .or_default();

        let outcome = match rows.get(&composite) {
            Some(existing) => match update {
                None => return Ok(InsertOutcome::Existed),
                Some(changes) => {
                    let old = existing.doc.clone();
                    let mut new = old.clone();
                    apply_write_set(&mut new, changes);
                    let row_id = existing.row_id;
                    rows.insert(composite, StoredRow { row_id, doc: new.clone() });
                    apply_aggregations(&mut staged, table, Some(&old), Some(&new));
                    InsertOutcome::Updated
                }
            },
            None => {
                let row_id = staged.next_row_id;
                staged.next_row_id += 1;
                staged
                    .tables
                    .entry(table.storage_name().to_string())
                    .or_default()
                    .insert(
                        composite,
                        StoredRow {
                            row_id,
                            doc: item.clone(),
                        },
                    );
                apply_aggregations(&mut staged, table, None, Some(item));
                InsertOutcome::Inserted
            }
        };
        self.store.persist(&staged)?;
        *data = staged;
        Ok(outcome)
    }

    async fn update(
        &self,
        table: &TableDef,
        identity: &Identity,
        changes: &WriteSet,
    ) -> Result<Option<Value>> {
        let composite = identity.composite(table.resource());
        let mut data = self.store.data.write();

        let old = match data
            .tables
            .get(table.storage_name())
            .and_then(|rows| rows.get(&composite))
        {
            Some(row) if identity.matches(&row.doc) => row.doc.clone(),
            _ => return Ok(None),
        };

        let mut new = old.clone();
        apply_write_set(&mut new, changes);
        let mut staged = data.clone();
        if let Some(row) = staged
            .tables
            .get_mut(table.storage_name())
            .and_then(|rows| rows.get_mut(&composite))
        {
            row.doc = new.clone();
        }
        apply_aggregations(&mut staged, table, Some(&old), Some(&new));
        self.store.persist(&staged)?;
        *data = staged;
        Ok(Some(table.finalize_row(new.clone()).unwrap_or(new)))
    }

    async fn delete(&self, table: &TableDef, identity: &Identity) -> Result<bool> {
        let composite = identity.composite(table.resource());
        let mut data = self.store.data.write();

        let matched = data
            .tables
            .get(table.storage_name())
            .and_then(|rows| rows.get(&composite))
            .map(|row| identity.matches(&row.doc))
            .unwrap_or(false);
        if !matched {
            return Ok(false);
        }

        let mut staged = data.clone();
        let removed = staged
            .tables
            .get_mut(table.storage_name())
            .and_then(|rows| rows.remove(&composite));
        if let Some(row) = removed {
            apply_aggregations(&mut staged, table, Some(&row.doc), None);
        }
        self.store.persist(&staged)?;
        *data = staged;
        Ok(true)
    }

    async fn fetch(&self, table: &TableDef, query: &Query, limit: usize) -> Result<FetchResult> {
        let data = self.store.data.read();
        let mut matched: Vec<Value> = data
            .tables
            .get(table.storage_name())
            .map(|rows| {
                rows.values()
                    .filter_map(|row| table.finalize_row(row.doc.clone()))
                    .filter(|doc| query.admits(doc))
                    .collect()
            })
            .unwrap_or_default();
        query.sort(&mut matched);
        let exhausted = matched.len() <= limit;
        matched.truncate(limit);
        Ok(FetchResult {
            rows: matched,
            exhausted,
        })
    }

    async fn count(&self, table: &TableDef, filters: &[(String, Filter)]) -> Result<u64> {
        let data = self.store.data.read();
        let count = data
            .tables
            .get(table.storage_name())
            .map(|rows| {
                rows.values()
                    .filter_map(|row| table.finalize_row(row.doc.clone()))
                    .filter(|doc| filters.iter().all(|(name, f)| f.matches(doc.get(name))))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn batch(
        &self,
        table: &TableDef,
        identities: &[Identity],
    ) -> Result<Vec<Option<Value>>> {
        let data = self.store.data.read();
        let rows = data.tables.get(table.storage_name());
        Ok(identities
            .iter()
            .map(|identity| {
                rows.and_then(|rows| rows.get(&identity.composite(table.resource())))
                    .filter(|row| identity.matches(&row.doc))
                    .and_then(|row| table.finalize_row(row.doc.clone()))
            })
            .collect())
    }
}
