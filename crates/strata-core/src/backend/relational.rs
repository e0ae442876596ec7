//! Postgres backend over a sqlx connection pool.
//!
//! Statements come from [`crate::sql::build`] and results go back through
//! [`crate::sql::rows`]; this module only binds parameters, runs statements,
//! and manages transactions.
//!
//! Mutations on tables with aggregation rules run inside a SERIALIZABLE
//! transaction so the counter adjustments commit atomically with the primary
//! write. Serialization conflicts (SQLSTATE 40001/40P01) retry the whole
//! transaction body with backoff; unique violations (23505) surface as
//! precondition failures.
//!
//! Large result sets stream through a server-side cursor
//! (`DECLARE`/`FETCH`). Deployments whose wire protocol cannot hold a cursor
//! open (data-API style proxies) use [`CursorMode::Emulated`], which fetches
//! the full result set and re-chunks it client-side.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, Row};
use tracing::{debug, warn};

use crate::backend::{Backend, FetchResult, InsertOutcome};
use crate::error::{BackendError, Error, Result};
use crate::query::{Filter, Query, WriteSet};
use crate::resource::{FieldKind, Identity};
use crate::sql::{SelectColumn, SqlParam, Statement, build, rows};
use crate::table::TableDef;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl RelationalConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            max_connections: 10,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// How large result sets are streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// `DECLARE ... CURSOR` / `FETCH FORWARD n` on a held connection.
    ServerSide,
    /// Fetch everything, then re-chunk client-side. For deployments whose
    /// wire protocol cannot hold a cursor open across requests; the full
    /// result set is buffered in memory.
    Emulated,
}

const MAX_TXN_ATTEMPTS: u32 = 5;
const STREAM_CURSOR: &str = "strata_stream";

pub struct RelationalBackend {
    pool: PgPool,
    cursor_mode: CursorMode,
}

impl RelationalBackend {
    pub fn new(pool: PgPool, cursor_mode: CursorMode) -> Self {
        Self { pool, cursor_mode }
    }

    pub async fn connect(config: &RelationalConfig, cursor_mode: CursorMode) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(BackendError::Sql)?;
        Ok(Self::new(pool, cursor_mode))
    }

    /// Run `body` inside a SERIALIZABLE transaction, retrying the whole body
    /// on serialization conflicts. The body must be re-runnable: everything
    /// it did in a failed attempt is rolled back before the next one.
    async fn transact<T, F>(&self, mut body: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let mut conn = self.pool.acquire().await.map_err(BackendError::Sql)?;
            sqlx::query("BEGIN ISOLATION LEVEL SERIALIZABLE")
                .execute(conn.as_mut())
                .await
                .map_err(BackendError::Sql)?;

            match body(conn.as_mut()).await {
                Ok(value) => match sqlx::query("COMMIT").execute(conn.as_mut()).await {
                    Ok(_) => return Ok(value),
                    Err(err) if is_serialization_failure(&err) && attempt < MAX_TXN_ATTEMPTS => {
                        warn!(attempt, "serialization conflict at commit; retrying");
                        backoff(attempt).await;
                    }
                    Err(err) => return Err(BackendError::Sql(err).into()),
                },
                Err(err) => {
                    let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
                    let retryable = matches!(
                        &err,
                        Error::Backend(BackendError::Sql(e)) if is_serialization_failure(e)
                    );
                    if retryable && attempt < MAX_TXN_ATTEMPTS {
                        warn!(attempt, "serialization conflict; retrying transaction");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(BackendError::RetriesExhausted {
            attempts: MAX_TXN_ATTEMPTS,
        }
        .into())
    }

    /// Open a chunked stream over every row the query matches.
    pub async fn stream(
        &self,
        table: &TableDef,
        query: &Query,
        chunk_size: usize,
    ) -> Result<RowStream> {
        let chunk_size = chunk_size.max(1);
        let since = query.since.as_ref();
        let stmt = build::select(
            table,
            &query.filters,
            Some((query.ordering.as_str(), query.direction, since)),
            None,
        )?;

        match self.cursor_mode {
            CursorMode::ServerSide => {
                let mut tx = self.pool.begin().await.map_err(BackendError::Sql)?;
                let declare = format!(
                    "DECLARE \"{STREAM_CURSOR}\" NO SCROLL CURSOR FOR {}",
                    stmt.text
                );
                bind_params(sqlx::query(&declare), &stmt.params)
                    .execute(&mut *tx)
                    .await
                    .map_err(BackendError::Sql)?;
                debug!(table = table.storage_name(), chunk_size, "opened server-side cursor");
                Ok(RowStream {
                    table: table.clone(),
                    chunk_size,
                    state: StreamState::Server {
                        tx: Some(tx),
                        columns: stmt.columns,
                    },
                })
            }
            CursorMode::Emulated => {
                let flats = fetch_rows(&self.pool, &stmt).await?;
                let pending = flats
                    .into_iter()
                    .filter_map(|flat| rows::decode_row(table, flat))
                    .collect();
                Ok(RowStream {
                    table: table.clone(),
                    chunk_size,
                    state: StreamState::Emulated { pending },
                })
            }
        }
    }
}

/// One streamed chunk. `complete` marks the final chunk of the stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub rows: Vec<Value>,
    pub complete: bool,
}

enum StreamState {
    Server {
        /// The transaction holding the cursor open. `None` once the stream
        /// has finished and committed.
        tx: Option<sqlx::Transaction<'static, Postgres>>,
        columns: Vec<SelectColumn>,
    },
    Emulated {
        pending: VecDeque<Value>,
    },
}

/// A chunked row stream. Dropping it early rolls the cursor's transaction
/// back through [`sqlx::Transaction`]'s drop guard.
pub struct RowStream {
    table: TableDef,
    chunk_size: usize,
    state: StreamState,
}

impl RowStream {
    /// The next chunk, or `None` once the stream has delivered a chunk
    /// flagged `complete`.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        match &mut self.state {
            StreamState::Server { tx: slot, columns } => {
                let tx = match slot.as_mut() {
                    Some(tx) => tx,
                    None => return Ok(None),
                };
                let fetch = format!("FETCH FORWARD {} FROM \"{STREAM_CURSOR}\"", self.chunk_size);
                let raw = sqlx::query(&fetch)
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(BackendError::Sql)?;
                let complete = raw.len() < self.chunk_size;
                let mut out = Vec::with_capacity(raw.len());
                for row in &raw {
                    if let Some(doc) = rows::decode_row(&self.table, extract(columns, row)?) {
                        out.push(doc);
                    }
                }
                if complete {
                    let _ = sqlx::query(&format!("CLOSE \"{STREAM_CURSOR}\""))
                        .execute(&mut **tx)
                        .await;
                    if let Some(tx) = slot.take() {
                        tx.commit().await.map_err(BackendError::Sql)?;
                    }
                    if out.is_empty() {
                        return Ok(None);
                    }
                }
                Ok(Some(Chunk {
                    rows: out,
                    complete,
                }))
            }
            StreamState::Emulated { pending } => {
                if pending.is_empty() {
                    return Ok(None);
                }
                let take = self.chunk_size.min(pending.len());
                let rows: Vec<Value> = pending.drain(..take).collect();
                Ok(Some(Chunk {
                    complete: pending.is_empty(),
                    rows,
                }))
            }
        }
    }
}

async fn backoff(attempt: u32) {
    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    matches!(sqlstate(err).as_deref(), Some("40001") | Some("40P01"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

/// A unique violation on an insert means the identity (or another unique
/// index) already holds the value: a precondition failure, not a transport
/// error.
fn reclassify_unique(table: &TableDef, err: Error) -> Error {
    match &err {
        Error::Backend(BackendError::Sql(e)) if is_unique_violation(e) => Error::Precondition {
            table: table.storage_name().to_string(),
        },
        _ => err,
    }
}

fn bind_params<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    params: &[SqlParam],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    let mut query = query;
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind(v.clone()),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Float(v) => query.bind(*v),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::Json(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Pull every declared column out of a result row by alias, as JSON values.
fn extract(columns: &[SelectColumn], row: &PgRow) -> Result<Vec<(String, Value)>> {
    let mut out = Vec::with_capacity(columns.len());
    for column in columns {
        let alias = column.alias.as_str();
        let value = match column.kind {
            FieldKind::String => row
                .try_get::<Option<String>, _>(alias)
                .map(|v| v.map(Value::from)),
            FieldKind::Integer => row
                .try_get::<Option<i64>, _>(alias)
                .map(|v| v.map(Value::from)),
            FieldKind::Float => row
                .try_get::<Option<f64>, _>(alias)
                .map(|v| v.map(Value::from)),
            FieldKind::Boolean => row
                .try_get::<Option<bool>, _>(alias)
                .map(|v| v.map(Value::from)),
            FieldKind::Json => row.try_get::<Option<Value>, _>(alias),
        }
        .map_err(BackendError::Sql)?;
        out.push((column.alias.clone(), value.unwrap_or(Value::Null)));
    }
    Ok(out)
}

/// Run a statement and extract its declared columns from every result row.
async fn fetch_rows<'e, E>(executor: E, stmt: &Statement) -> Result<Vec<Vec<(String, Value)>>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let raw = bind_params(sqlx::query(&stmt.text), &stmt.params)
        .fetch_all(executor)
        .await
        .map_err(BackendError::Sql)?;
    raw.iter().map(|row| extract(&stmt.columns, row)).collect()
}

async fn execute_stmt<'e, E>(executor: E, stmt: &Statement) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    bind_params(sqlx::query(&stmt.text), &stmt.params)
        .execute(executor)
        .await
        .map_err(BackendError::Sql)?;
    Ok(())
}

/// A select of the current row by identity keys, locked `FOR UPDATE` so the
/// pre-image cannot change under an upsert within the same transaction.
fn locked_select(table: &TableDef, identity: &Identity) -> Result<Statement> {
    let filters: Vec<(String, Filter)> = identity
        .keys
        .iter()
        .map(|(name, value)| (name.clone(), Filter::Eq(value.clone())))
        .collect();
    let mut stmt = build::select(table, &filters, None, Some(1))?;
    if table.joins().is_empty() {
        stmt.text.push_str(" FOR UPDATE");
    } else {
        // Outer-joined sides are not lockable; lock the base table only.
        stmt.text
            .push_str(&format!(" FOR UPDATE OF \"{}\"", table.storage_name()));
    }
    Ok(stmt)
}

fn insert_outcome(flat: &[(String, Value)]) -> InsertOutcome {
    let inserted = flat
        .iter()
        .find(|(alias, _)| alias == "strata.inserted")
        .and_then(|(_, v)| v.as_bool())
        .unwrap_or(false);
    if inserted {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::Updated
    }
}

#[async_trait]
impl Backend for RelationalBackend {
    fn supports_aggregation(&self) -> bool {
        true
    }

    async fn get(&self, table: &TableDef, identity: &Identity) -> Result<Option<Value>> {
        let filters: Vec<(String, Filter)> = identity
            .pairs()
            .map(|(name, value)| (name.to_string(), Filter::Eq(value.clone())))
            .collect();
        let stmt = build::select(table, &filters, None, Some(1))?;
        let flats = fetch_rows(&self.pool, &stmt).await?;
        Ok(flats
            .into_iter()
            .next()
            .and_then(|flat| rows::decode_row(table, flat)))
    }

    async fn insert(
        &self,
        table: &TableDef,
        item: &Value,
        update: Option<&WriteSet>,
    ) -> Result<InsertOutcome> {
        let stmt = build::insert(table, item, update)?;

        if table.aggregations().is_empty() {
            let flats = fetch_rows(&self.pool, &stmt)
                .await
                .map_err(|err| reclassify_unique(table, err))?;
            return Ok(match flats.into_iter().next() {
                None => InsertOutcome::Existed,
                Some(flat) => insert_outcome(&flat),
            });
        }

        // Counter maintenance needs the pre-image, so the upsert runs in a
        // transaction with the existing row locked first.
        let identity = table.resource().identity_of(item)?;
        let lock_stmt = locked_select(table, &identity)?;

        self.transact(|conn| {
            // Each attempt's future owns its statements; the body may be
            // re-run on a serialization conflict.
            let stmt = stmt.clone();
            let lock_stmt = lock_stmt.clone();
            let table = table.clone();
            Box::pin(async move {
                let old = fetch_rows(&mut *conn, &lock_stmt)
                    .await?
                    .into_iter()
                    .next()
                    .and_then(|flat| rows::decode_row(&table, flat));

                let flats = fetch_rows(&mut *conn, &stmt)
                    .await
                    .map_err(|err| reclassify_unique(&table, err))?;
                let (outcome, new) = match flats.into_iter().next() {
                    None => (InsertOutcome::Existed, None),
                    Some(flat) => {
                        let outcome = insert_outcome(&flat);
                        (outcome, rows::decode_row(&table, flat))
                    }
                };

                if outcome != InsertOutcome::Existed {
                    for adj in table.aggregation_deltas(old.as_ref(), new.as_ref()) {
                        let inc = build::increment(&adj.target, &adj.field, &adj.key, adj.delta);
                        execute_stmt(&mut *conn, &inc).await?;
                    }
                }
                Ok(outcome)
            })
        })
        .await
    }

    async fn update(
        &self,
        table: &TableDef,
        identity: &Identity,
        changes: &WriteSet,
    ) -> Result<Option<Value>> {
        if table.aggregations().is_empty() {
            let stmt = build::update(table, identity, changes, false)?;
            let flats = fetch_rows(&self.pool, &stmt).await?;
            return Ok(flats
                .into_iter()
                .next()
                .and_then(|flat| rows::decode_row(table, flat)));
        }

        let stmt = build::update(table, identity, changes, true)?;
        self.transact(|conn| {
            let stmt = stmt.clone();
            let table = table.clone();
            Box::pin(async move {
                let flats = fetch_rows(&mut *conn, &stmt).await?;
                let flat = match flats.into_iter().next() {
                    Some(flat) => flat,
                    None => return Ok(None),
                };
                let (old, new) = rows::decode_images(&table, flat);
                for adj in table.aggregation_deltas(old.as_ref(), new.as_ref()) {
                    let inc = build::increment(&adj.target, &adj.field, &adj.key, adj.delta);
                    execute_stmt(&mut *conn, &inc).await?;
                }
                Ok(new)
            })
        })
        .await
    }

    async fn delete(&self, table: &TableDef, identity: &Identity) -> Result<bool> {
        let stmt = build::delete(table, identity)?;

        if table.aggregations().is_empty() {
            let flats = fetch_rows(&self.pool, &stmt).await?;
            return Ok(!flats.is_empty());
        }

        self.transact(|conn| {
            let stmt = stmt.clone();
            let table = table.clone();
            Box::pin(async move {
                let flats = fetch_rows(&mut *conn, &stmt).await?;
                let deleted = !flats.is_empty();
                let old = flats
                    .into_iter()
                    .next()
                    .and_then(|flat| rows::decode_row(&table, flat));
                for adj in table.aggregation_deltas(old.as_ref(), None) {
                    let inc = build::increment(&adj.target, &adj.field, &adj.key, adj.delta);
                    execute_stmt(&mut *conn, &inc).await?;
                }
                Ok(deleted)
            })
        })
        .await
    }

    async fn fetch(&self, table: &TableDef, query: &Query, limit: usize) -> Result<FetchResult> {
        let since = query.since.as_ref();
        let stmt = build::select(
            table,
            &query.filters,
            Some((query.ordering.as_str(), query.direction, since)),
            Some(limit),
        )?;
        let flats = fetch_rows(&self.pool, &stmt).await?;
        let exhausted = flats.len() < limit;
        let rows = flats
            .into_iter()
            .filter_map(|flat| rows::decode_row(table, flat))
            .collect();
        Ok(FetchResult { rows, exhausted })
    }

    async fn count(&self, table: &TableDef, filters: &[(String, Filter)]) -> Result<u64> {
        let stmt = build::count(table, filters)?;
        let flats = fetch_rows(&self.pool, &stmt).await?;
        let count = flats
            .into_iter()
            .next()
            .and_then(|flat| {
                flat.into_iter()
                    .find(|(alias, _)| alias == "strata.count")
                    .and_then(|(_, v)| v.as_i64())
            })
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn batch(
        &self,
        table: &TableDef,
        identities: &[Identity],
    ) -> Result<Vec<Option<Value>>> {
        if identities.is_empty() {
            return Ok(Vec::new());
        }
        let stmt = build::batch_select(table, identities)?;
        let flats = fetch_rows(&self.pool, &stmt).await?;
        let decoded: Vec<Value> = flats
            .into_iter()
            .filter_map(|flat| rows::decode_row(table, flat))
            .collect();
        Ok(identities
            .iter()
            .map(|identity| decoded.iter().find(|row| identity.matches(row)).cloned())
            .collect())
    }
}
