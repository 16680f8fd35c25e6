//! The remote entity source contract.
//!
//! [`EntitySource`] is the engine's only view of the remote service. The
//! engine drives it three ways: an upfront total count per entity type, a
//! sequential paginated scan following server continuation cursors, and
//! unpaginated filtered reads for key-anchored fetches.

use std::future::Future;

use crate::catalog::EntityType;
use crate::error::SyncResult;
use crate::types::Record;

pub mod memory;
pub mod odata;

/// Opaque server continuation cursor for paginated fetches.
///
/// The engine never interprets the cursor; it only threads the one returned
/// by page N into the request for page N+1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub String);

/// One page of records as returned by the remote service.
#[derive(Debug)]
pub struct Page {
    /// Records of this page.
    pub records: Vec<Record>,
    /// Continuation cursor; `None` on the last page.
    pub next: Option<PageCursor>,
    /// Total count the server reported alongside this page. Unreliable
    /// servers change it between pages; callers log and adopt the new value.
    pub reported_total: u64,
}

/// Parameters of a single paginated request.
#[derive(Debug)]
pub struct PageRequest<'a> {
    /// Entity type to fetch.
    pub entity_type: &'a EntityType,
    /// Filter expression, if any.
    pub filter: Option<&'a str>,
    /// Field subset to request; full records when unset.
    pub fields: Option<&'a [String]>,
    /// Continuation cursor from the previous page; `None` for the first page.
    pub cursor: Option<PageCursor>,
}

/// Trait for services the engine can replicate from.
///
/// Implementations are expected to be cheap to share behind an [`std::sync::Arc`];
/// all methods take `&self` and may be called from many workers concurrently.
/// Per-call timeouts are the implementation's responsibility; a timeout is
/// reported like any other request failure.
pub trait EntitySource: Send + Sync + 'static {
    /// Returns the expected total number of records of `entity_type`,
    /// honoring `filter` when given.
    fn total_count(
        &self,
        entity_type: &EntityType,
        filter: Option<&str>,
    ) -> impl Future<Output = SyncResult<u64>> + Send;

    /// Fetches one page of records.
    fn fetch_page(
        &self,
        request: PageRequest<'_>,
    ) -> impl Future<Output = SyncResult<Page>> + Send;

    /// Fetches all records matching `filter` in a single unpaginated response.
    ///
    /// Used by key-anchored fetches, where each filter selects the handful of
    /// records referencing one principal key.
    fn fetch_filtered(
        &self,
        entity_type: &EntityType,
        filter: &str,
    ) -> impl Future<Output = SyncResult<Vec<Record>>> + Send;
}
