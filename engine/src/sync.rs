//! Synchronization adapter contract.
//!
//! The engine never speaks a transport. Every remote read or write goes
//! through a [`SyncAdapter`] supplied by the application: the engine builds a
//! [`SyncRequest`], awaits the adapter, and merges the raw JSON payload it
//! resolves with. Failures come back as a [`SyncError`].

use crate::{comparator::SortDirection, Record, RecordId, Store};
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Status text reported for cancelled requests.
pub const STATUS_ABORT: &str = "abort";

/// Remote operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    Create,
    Read,
    Update,
    Patch,
    Delete,
}

impl SyncMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::Create => "create",
            SyncMethod::Read => "read",
            SyncMethod::Update => "update",
            SyncMethod::Patch => "patch",
            SyncMethod::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a request operates on.
#[derive(Debug, Clone)]
pub enum SyncTarget {
    Record(Record),
    Store(Store),
}

/// Virtualization and query parameters sent with a read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchParams {
    /// First position requested
    pub start_index: Option<usize>,
    /// Page size requested
    pub fetch_size: Option<usize>,
    /// Identity to start the page from
    #[serde(rename = "startID")]
    pub start_id: Option<RecordId>,
    pub since: Option<Value>,
    pub until: Option<Value>,
    /// Comparator attribute(s) for server-side ordering
    pub sort: Option<String>,
    pub sort_dir: Option<SortDirection>,
    /// Serialized server query, see [`crate::query::Query::to_query_string`]
    pub query: Option<String>,
    /// Ask for everything regardless of page size
    pub all: bool,
}

impl FetchParams {
    /// Render the parameters as REST query pairs.
    ///
    /// Order: `limit`, `offset`, `orderBy`, `q`, `fromID`, `since`, `until`,
    /// `totalResults`.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if !self.all {
            if let Some(size) = self.fetch_size {
                pairs.push(("limit".to_string(), size.to_string()));
            }
        }
        if let Some(start) = self.start_index {
            pairs.push(("offset".to_string(), start.to_string()));
        }
        if let Some(sort) = &self.sort {
            let dir = self.sort_dir.unwrap_or_default();
            let order = sort
                .split(',')
                .map(|attr| format!("{}:{}", attr.trim(), dir.as_str()))
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("orderBy".to_string(), order));
        }
        if let Some(query) = &self.query {
            pairs.push(("q".to_string(), query.clone()));
        }
        if let Some(id) = &self.start_id {
            pairs.push(("fromID".to_string(), id.to_string()));
        }
        if let Some(since) = &self.since {
            pairs.push(("since".to_string(), crate::value::display_value(since)));
        }
        if let Some(until) = &self.until {
            pairs.push(("until".to_string(), crate::value::display_value(until)));
        }
        pairs.push(("totalResults".to_string(), "true".to_string()));
        pairs
    }
}

/// A single call into the adapter.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub method: SyncMethod,
    pub url: String,
    pub target: SyncTarget,
    /// Body for create/update/patch
    pub payload: Option<Value>,
    pub params: FetchParams,
}

/// Transport failure reported by an adapter.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("sync failed ({status} {status_text}): {error}")]
pub struct SyncError {
    /// Transport status code, `0` when no response was received
    pub status: u16,
    /// Status token such as `"error"`, `"timeout"` or `"abort"`
    pub status_text: String,
    pub error: String,
    /// Raw response body, if any
    pub response: Option<Value>,
}

impl SyncError {
    pub fn new(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            status_text: "error".to_string(),
            error: error.into(),
            response: None,
        }
    }

    /// The error produced when an outstanding request is cancelled.
    pub fn aborted() -> Self {
        Self {
            status: 0,
            status_text: STATUS_ABORT.to_string(),
            error: "request aborted".to_string(),
            response: None,
        }
    }

    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.status_text == STATUS_ABORT
    }
}

/// Outstanding requests of one store, cancelled together by
/// [`Store::abort`](crate::Store::abort). Shared with the records the store
/// owns so their own requests are cancelled along with the store's.
#[derive(Debug, Default)]
pub(crate) struct RequestSet {
    next: AtomicU64,
    handles: Mutex<HashMap<u64, AbortHandle>>,
}

impl RequestSet {
    /// Run `request` as a tracked, cancellable request. An aborted request
    /// resolves to [`SyncError::aborted`].
    pub(crate) async fn track<F>(&self, request: F) -> Result<Value, SyncError>
    where
        F: Future<Output = Result<Value, SyncError>>,
    {
        let (handle, registration) = AbortHandle::new_pair();
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(id, handle);
        let _untrack = Untrack { set: self, id };
        match Abortable::new(request, registration).await {
            Ok(outcome) => outcome,
            Err(_aborted) => Err(SyncError::aborted()),
        }
    }

    /// Cancel everything outstanding; returns how many were cancelled.
    pub(crate) fn abort_all(&self) -> usize {
        let handles: Vec<AbortHandle> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }
}

struct Untrack<'a> {
    set: &'a RequestSet,
    id: u64,
}

impl Drop for Untrack<'_> {
    fn drop(&mut self) {
        self.set.handles.lock().remove(&self.id);
    }
}

/// The transport collaborator.
#[async_trait]
pub trait SyncAdapter: Send + Sync {
    /// Perform `request`, resolving with the raw response payload.
    async fn sync(&self, request: SyncRequest) -> Result<Value, SyncError>;
}

/// Adapter built from a closure returning a boxed future.
pub struct FnAdapter<F>(F);

/// Wrap a closure as a [`SyncAdapter`].
pub fn adapter_fn<F>(f: F) -> FnAdapter<F>
where
    F: Fn(SyncRequest) -> BoxFuture<'static, Result<Value, SyncError>> + Send + Sync,
{
    FnAdapter(f)
}

#[async_trait]
impl<F> SyncAdapter for FnAdapter<F>
where
    F: Fn(SyncRequest) -> BoxFuture<'static, Result<Value, SyncError>> + Send + Sync,
{
    async fn sync(&self, request: SyncRequest) -> Result<Value, SyncError> {
        (self.0)(request).await
    }
}
