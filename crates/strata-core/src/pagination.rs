//! Cursor pagination over a backend's raw fetch primitive.
//!
//! Backends fetch a fixed window of raw rows, but post-fetch validation can
//! drop rows (corrupt legacy data), leaving a page short. [`list`] widens
//! the window (doubling) and re-issues the fetch from the original bound
//! until it has the requested count of valid rows or the source is
//! exhausted.
//!
//! The cursor contract: re-issuing the query with `since = page.next`
//! continues strictly after the last returned record, with no duplicates
//! and no gaps among records that existed for the whole walk. `next: None`
//! means the walk has reached the boundary.

use serde_json::Value;
use tracing::debug;

use crate::backend::Backend;
use crate::error::Result;
use crate::query::{Page, Query, has_empty_membership};
use crate::table::TableDef;

/// Fetch one page of results for the query.
pub async fn list(backend: &dyn Backend, table: &TableDef, query: &Query) -> Result<Page> {
    let requested = query.fetch_size;
    let mut window = requested;

    loop {
        let fetched = backend.fetch(table, query, window).await?;

        if fetched.rows.len() >= requested || fetched.exhausted {
            let exhausted = fetched.exhausted && fetched.rows.len() <= requested;
            let mut results = fetched.rows;
            results.truncate(requested);
            let next = if exhausted {
                None
            } else {
                results
                    .last()
                    .and_then(|row| row.get(&query.ordering))
                    .cloned()
            };
            return Ok(Page { results, next });
        }

        // Validation drops thinned the window below the requested count.
        window *= 2;
        debug!(
            table = table.storage_name(),
            window, "page came back short; widening fetch window"
        );
    }
}

/// A pull-based batch sequence over every record the query matches.
///
/// Each `next_batch` call follows the previous page's cursor, so the scan is
/// restartable from scratch but not resumable mid-stream: records mutated
/// while the scan runs may be observed in either state.
pub struct Scan<'a> {
    backend: &'a dyn Backend,
    table: &'a TableDef,
    query: Query,
    done: bool,
}

impl<'a> Scan<'a> {
    pub fn new(backend: &'a dyn Backend, table: &'a TableDef, query: Query) -> Self {
        let done = has_empty_membership(&query.filters);
        Self {
            backend,
            table,
            query,
            done,
        }
    }

    /// The next batch of records, or `None` once the scan is complete.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        if self.done {
            return Ok(None);
        }
        let page = list(self.backend, self.table, &self.query).await?;
        match page.next {
            Some(next) => self.query.since = Some(next),
            None => self.done = true,
        }
        if page.results.is_empty() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(page.results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::backend::document::{DocumentBackend, DocumentRegistry};
    use crate::resource::{Field, Resource};
    use serde_json::json;
    use tempfile::TempDir;

    fn events_table() -> TableDef {
        let resource = Resource::builder("event")
            .field("id", Field::string())
            .field("seq", Field::integer())
            .field("name", Field::string())
            .identity_key("id")
            .build()
            .unwrap();
        TableDef::new("events", resource)
    }

    async fn seeded_backend(dir: &TempDir, count: usize) -> DocumentBackend {
        let registry = DocumentRegistry::new();
        let backend = DocumentBackend::new(registry.open(dir.path().join("events.db")).unwrap());
        let table = events_table();
        for n in 0..count {
            backend
                .insert(
                    &table,
                    &json!({"id": format!("e{n:04}"), "seq": n, "name": "event"}),
                    None,
                )
                .await
                .unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn test_pages_split_100_100_50() {
        let dir = TempDir::new().unwrap();
        let backend = seeded_backend(&dir, 250).await;
        let table = events_table();

        let first = list(&backend, &table, &Query::new("seq")).await.unwrap();
        assert_eq!(first.results.len(), 100);
        assert_eq!(first.next, Some(json!(99)));

        let second = list(&backend, &table, &Query::new("seq").since(json!(99)))
            .await
            .unwrap();
        assert_eq!(second.results.len(), 100);
        assert_eq!(second.results[0]["seq"], 100);
        assert_eq!(second.next, Some(json!(199)));

        let third = list(&backend, &table, &Query::new("seq").since(json!(199)))
            .await
            .unwrap();
        assert_eq!(third.results.len(), 50);
        assert_eq!(third.next, None);
    }

    #[tokio::test]
    async fn test_window_widens_past_dropped_rows() {
        let dir = TempDir::new().unwrap();
        let backend = seeded_backend(&dir, 30).await;
        let table = events_table();

        // Rows missing the required name fail validation on read and are
        // dropped; the list loop must widen the window to fill the page.
        for n in 30..90 {
            backend
                .insert(&table, &json!({"id": format!("x{n:04}"), "seq": n}), None)
                .await
                .unwrap();
        }

        let page = list(&backend, &table, &Query::new("seq").fetch_size(25))
            .await
            .unwrap();
        assert_eq!(page.results.len(), 25);
        assert!(page.results.iter().all(|row| row["name"] == "event"));
    }

    #[tokio::test]
    async fn test_exhausted_short_page_has_no_cursor() {
        let dir = TempDir::new().unwrap();
        let backend = seeded_backend(&dir, 7).await;
        let table = events_table();

        let page = list(&backend, &table, &Query::new("seq")).await.unwrap();
        assert_eq!(page.results.len(), 7);
        assert_eq!(page.next, None);
    }

    #[tokio::test]
    async fn test_scan_walks_every_record_once() {
        let dir = TempDir::new().unwrap();
        let backend = seeded_backend(&dir, 23).await;
        let table = events_table();

        let mut scan = Scan::new(&backend, &table, Query::new("seq").fetch_size(10));
        let mut seen = Vec::new();
        while let Some(batch) = scan.next_batch().await.unwrap() {
            seen.extend(batch);
        }
        assert_eq!(seen.len(), 23);
        for (n, row) in seen.iter().enumerate() {
            assert_eq!(row["seq"], json!(n));
        }
        assert!(scan.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_descending_pages() {
        let dir = TempDir::new().unwrap();
        let backend = seeded_backend(&dir, 12).await;
        let table = events_table();

        let query = Query::new("seq").descending().fetch_size(5);
        let first = list(&backend, &table, &query).await.unwrap();
        assert_eq!(first.results[0]["seq"], 11);
        assert_eq!(first.next, Some(json!(7)));

        let second = list(&backend, &table, &query.clone().since(json!(7)))
            .await
            .unwrap();
        assert_eq!(second.results[0]["seq"], 6);
    }
}
