//! In-memory entity source for testing and development.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bail;
use crate::catalog::EntityType;
use crate::error::{ErrorKind, SyncResult};
use crate::source::{EntitySource, Page, PageCursor, PageRequest};
use crate::types::Record;

/// Default page size of the memory source.
const DEFAULT_PAGE_SIZE: usize = 2;

#[derive(Debug, Default)]
struct TypeData {
    records: Vec<Record>,
    /// Scripted totals reported page by page; the real count applies once
    /// the script is exhausted.
    drift: VecDeque<u64>,
    /// Number of upcoming fetch calls that fail with a request error.
    failures: u32,
}

#[derive(Debug)]
struct Inner {
    types: HashMap<String, TypeData>,
    /// Chronological log of requests, e.g. `page:Party` or `filtered:Vote`.
    log: Vec<String>,
    page_size: usize,
}

/// In-memory source for tests and development runs.
///
/// Serves scripted records with server-style pagination and supports the
/// misbehaviors the engine must tolerate: totals drifting between pages and
/// transient request failures.
#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    /// Creates an empty source with the default page size.
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty source serving `page_size` records per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                types: HashMap::new(),
                log: Vec::new(),
                page_size: page_size.max(1),
            })),
        }
    }

    /// Adds records for an entity type.
    pub async fn insert_records(&self, entity_type: &str, records: Vec<Record>) {
        let mut inner = self.inner.lock().await;
        inner
            .types
            .entry(entity_type.to_string())
            .or_default()
            .records
            .extend(records);
    }

    /// Scripts the totals reported alongside the next pages of `entity_type`.
    pub async fn script_total_drift(&self, entity_type: &str, totals: Vec<u64>) {
        let mut inner = self.inner.lock().await;
        inner
            .types
            .entry(entity_type.to_string())
            .or_default()
            .drift
            .extend(totals);
    }

    /// Makes the next `count` fetch calls for `entity_type` fail.
    pub async fn fail_next_requests(&self, entity_type: &str, count: u32) {
        let mut inner = self.inner.lock().await;
        inner
            .types
            .entry(entity_type.to_string())
            .or_default()
            .failures += count;
    }

    /// Chronological request log, for ordering assertions in tests.
    pub async fn request_log(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.log.clone()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal filter evaluation: `Field eq literal` clauses joined by ` and `,
/// optionally parenthesized, which is the shape the engine itself generates.
fn matches_filter(record: &Record, filter: &str) -> bool {
    filter.split(" and ").all(|clause| {
        let clause = clause.trim().trim_start_matches('(').trim_end_matches(')');
        match clause.split_once(" eq ") {
            Some((field, literal)) => record
                .get(field.trim())
                .map(|value| value.filter_literal() == literal.trim())
                .unwrap_or(false),
            // Clauses the evaluator does not understand match everything.
            None => true,
        }
    })
}

fn filtered_records(data: &TypeData, filter: Option<&str>) -> Vec<Record> {
    data.records
        .iter()
        .filter(|record| filter.is_none_or(|f| matches_filter(record, f)))
        .cloned()
        .collect()
}

impl EntitySource for MemorySource {
    async fn total_count(&self, entity_type: &EntityType, filter: Option<&str>) -> SyncResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.log.push(format!("total:{}", entity_type.name));

        let count = inner
            .types
            .get(&entity_type.name)
            .map(|data| filtered_records(data, filter).len() as u64)
            .unwrap_or(0);

        Ok(count)
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> SyncResult<Page> {
        let mut inner = self.inner.lock().await;
        inner.log.push(format!("page:{}", request.entity_type.name));
        let page_size = inner.page_size;

        let data = inner
            .types
            .entry(request.entity_type.name.clone())
            .or_default();

        if data.failures > 0 {
            data.failures -= 1;
            bail!(
                ErrorKind::SourceRequestFailed,
                "Scripted request failure",
                format!("fetch of `{}` failed on request", request.entity_type.name)
            );
        }

        let records = filtered_records(data, request.filter);
        let reported_total = data
            .drift
            .pop_front()
            .unwrap_or(records.len() as u64);

        let offset: usize = match &request.cursor {
            Some(PageCursor(cursor)) => cursor.parse().map_err(|_| {
                crate::sync_error!(
                    ErrorKind::SourceResponseInvalid,
                    "Unparseable continuation cursor",
                    format!("cursor `{cursor}` is not an offset")
                )
            })?,
            None => 0,
        };

        let end = (offset + page_size).min(records.len());
        let next = (end < records.len()).then(|| PageCursor(end.to_string()));

        Ok(Page {
            records: records[offset.min(end)..end].to_vec(),
            next,
            reported_total,
        })
    }

    async fn fetch_filtered(
        &self,
        entity_type: &EntityType,
        filter: &str,
    ) -> SyncResult<Vec<Record>> {
        let mut inner = self.inner.lock().await;
        inner.log.push(format!("filtered:{}", entity_type.name));

        let data = inner.types.entry(entity_type.name.clone()).or_default();

        if data.failures > 0 {
            data.failures -= 1;
            bail!(
                ErrorKind::SourceRequestFailed,
                "Scripted request failure",
                format!("filtered fetch of `{}` failed on request", entity_type.name)
            );
        }

        Ok(filtered_records(data, Some(filter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::parliament_catalog;
    use crate::types::Value;

    fn party_records(count: i32) -> Vec<Record> {
        (0..count)
            .map(|id| {
                [
                    ("ID", Value::I32(id)),
                    ("Name", Value::Text(format!("P{id}"))),
                ]
                .into_iter()
                .collect()
            })
            .collect()
    }

    #[tokio::test]
    async fn paginates_with_cursors() {
        let catalog = parliament_catalog();
        let party = catalog.entity_type(catalog.resolve("Party").unwrap());

        let source = MemorySource::with_page_size(2);
        source.insert_records("Party", party_records(5)).await;

        let mut fetched = 0;
        let mut cursor = None;
        loop {
            let page = source
                .fetch_page(PageRequest {
                    entity_type: party,
                    filter: None,
                    fields: None,
                    cursor,
                })
                .await
                .unwrap();

            fetched += page.records.len();
            assert_eq!(page.reported_total, 5);

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(fetched, 5);
    }

    #[tokio::test]
    async fn filter_restricts_records() {
        let catalog = parliament_catalog();
        let party = catalog.entity_type(catalog.resolve("Party").unwrap());

        let source = MemorySource::new();
        source.insert_records("Party", party_records(4)).await;

        let records = source.fetch_filtered(party, "ID eq 2").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("ID"), Some(&Value::I32(2)));

        assert_eq!(source.total_count(party, Some("ID eq 2")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_fire_once_each() {
        let catalog = parliament_catalog();
        let party = catalog.entity_type(catalog.resolve("Party").unwrap());

        let source = MemorySource::new();
        source.insert_records("Party", party_records(1)).await;
        source.fail_next_requests("Party", 1).await;

        let first = source
            .fetch_page(PageRequest {
                entity_type: party,
                filter: None,
                fields: None,
                cursor: None,
            })
            .await;
        assert!(first.is_err());

        let second = source
            .fetch_page(PageRequest {
                entity_type: party,
                filter: None,
                fields: None,
                cursor: None,
            })
            .await;
        assert!(second.is_ok());
    }
}
