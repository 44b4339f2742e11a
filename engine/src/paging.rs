//! Paging metadata.
//!
//! A read response is either a bare array of records or an envelope object
//! carrying `items` together with optional `offset`, `limit`, `count`,
//! `totalResults` and `hasMore`. [`PagingState::update`] folds that metadata
//! into the store's paging state, falling back to the request parameters and
//! then to the prior state for anything the server leaves out.

use crate::{config::PagingFn, error::Result, sync::FetchParams, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Paging metadata reported by the server for one response.
///
/// `total_results` of `-1` means the server does not know the total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PagingInfo {
    pub total_results: Option<i64>,
    pub limit: Option<i64>,
    pub count: Option<i64>,
    pub offset: Option<i64>,
    pub has_more: Option<bool>,
}

impl PagingInfo {
    /// Read the envelope fields of an object response. Fields of the wrong
    /// type are ignored.
    pub fn from_envelope(response: &Value) -> Self {
        let int = |key: &str| response.get(key).and_then(Value::as_i64);
        Self {
            total_results: int("totalResults"),
            limit: int("limit"),
            count: int("count"),
            offset: int("offset"),
            has_more: response.get("hasMore").and_then(Value::as_bool),
        }
    }
}

/// A parsed read response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub info: PagingInfo,
}

impl Page {
    /// Split a raw response into records and paging metadata.
    ///
    /// With an `extractor`, paging metadata comes solely from it. An object
    /// without `items` is taken as a single record.
    pub fn parse(response: Value, extractor: Option<&PagingFn>) -> Result<Self> {
        let info = match extractor {
            Some(f) => f(&response),
            None if response.is_object() => PagingInfo::from_envelope(&response),
            None => PagingInfo::default(),
        };
        let items = match response {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(Error::InvalidPayload(format!(
                        "items must be an array, got {}",
                        other
                    )))
                }
                None => vec![Value::Object(map)],
            },
            Value::Null => Vec::new(),
            other => {
                return Err(Error::InvalidPayload(format!(
                    "expected an array or object response, got {}",
                    other
                )))
            }
        };
        Ok(Self { items, info })
    }
}

/// Paging state held by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingState {
    /// Start index of the last fetch
    pub offset: usize,
    /// Page size of the last fetch
    pub last_fetch_size: Option<usize>,
    /// Records returned by the last fetch
    pub last_fetch_count: usize,
    /// Authoritative total, if known
    pub total_results: Option<usize>,
    pub has_more: bool,
}

impl Default for PagingState {
    fn default() -> Self {
        Self {
            offset: 0,
            last_fetch_size: None,
            last_fetch_count: 0,
            total_results: None,
            has_more: true,
        }
    }
}

fn non_negative(n: Option<i64>) -> Option<usize> {
    n.and_then(|n| usize::try_from(n).ok())
}

impl PagingState {
    /// Fold one response into the state.
    ///
    /// `data_len` is the number of records the response carried; it stands
    /// in for a missing `count`.
    pub fn update(&mut self, info: &PagingInfo, request: &FetchParams, data_len: usize) {
        self.offset = non_negative(info.offset)
            .or(request.start_index)
            .unwrap_or(self.offset);
        self.last_fetch_size = non_negative(info.limit)
            .or(request.fetch_size)
            .or(self.last_fetch_size);
        self.last_fetch_count = non_negative(info.count).unwrap_or(data_len);
        self.total_results = match info.total_results {
            Some(-1) => None,
            Some(n) => non_negative(Some(n)).or(self.total_results),
            None => self.total_results,
        };
        self.has_more = info.has_more.unwrap_or_else(|| match self.total_results {
            None => true,
            Some(total) => {
                self.offset + self.last_fetch_size.unwrap_or(self.last_fetch_count) <= total
            }
        });

        if !self.has_more && self.total_results.is_none() {
            self.total_results = Some(self.offset + self.last_fetch_count);
        }
    }

    /// Index one past the last record of the last fetch.
    pub fn fetched_end(&self) -> usize {
        self.offset + self.last_fetch_count
    }

    /// Whether `index` lies at or beyond the known end of data.
    pub fn is_past_end(&self, index: usize) -> bool {
        self.total_results.is_some_and(|total| index >= total)
    }
}
