//! In-memory paging server shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use recordset_engine::{
    FetchParams, Observable, Store, StoreConfig, StoreEvent, SyncAdapter, SyncError, SyncMethod,
    SyncRequest, ALL,
};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Serves a list of records with offset/limit paging.
pub struct MockServer {
    pub data: Mutex<Vec<Value>>,
    /// Every request received, in arrival order
    pub requests: Mutex<Vec<(SyncMethod, FetchParams)>>,
    /// Report `totalResults`; otherwise only `hasMore`
    pub report_total: bool,
    pub delay: Option<Duration>,
    pub fail_with: Mutex<Option<SyncError>>,
    next_id: Mutex<i64>,
}

impl MockServer {
    pub fn with_items(count: usize) -> Arc<Self> {
        Self::build(count, true, None)
    }

    pub fn without_total(count: usize) -> Arc<Self> {
        Self::build(count, false, None)
    }

    pub fn slow(count: usize, delay: Duration) -> Arc<Self> {
        Self::build(count, true, Some(delay))
    }

    fn build(count: usize, report_total: bool, delay: Option<Duration>) -> Arc<Self> {
        let data = (0..count)
            .map(|i| {
                json!({
                    "id": i,
                    "name": format!("item {:03}", i),
                    "rank": (count - i) as i64,
                    "dept": if i % 2 == 0 { "even" } else { "odd" },
                })
            })
            .collect();
        Arc::new(Self {
            data: Mutex::new(data),
            requests: Mutex::new(Vec::new()),
            report_total,
            delay,
            fail_with: Mutex::new(None),
            next_id: Mutex::new(count as i64),
        })
    }

    pub fn reads(&self) -> Vec<FetchParams> {
        self.requests
            .lock()
            .iter()
            .filter(|(m, _)| *m == SyncMethod::Read)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn read_count(&self) -> usize {
        self.reads().len()
    }

    fn matches_query(item: &Value, query: &str) -> bool {
        query.split(';').filter(|t| !t.is_empty()).all(|token| {
            let Some((attr, expected)) = token.split_once('=') else {
                return false;
            };
            let attr = percent_decode_str(attr).decode_utf8_lossy();
            let expected = percent_decode_str(expected).decode_utf8_lossy();
            match item.get(attr.as_ref()) {
                Some(Value::String(s)) => *s == expected,
                Some(other) => other.to_string() == expected,
                None => false,
            }
        })
    }

    fn read(&self, params: &FetchParams) -> Value {
        let mut data = self.data.lock().clone();
        if let Some(query) = &params.query {
            data.retain(|item| query.split(',').any(|alt| Self::matches_query(item, alt)));
        }
        if let Some(sort) = &params.sort {
            let descending = params
                .sort_dir
                .is_some_and(|d| d == recordset_engine::SortDirection::Descending);
            data.sort_by(|a, b| {
                let ordering = compare(a.get(sort.as_str()), b.get(sort.as_str()));
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        let total = data.len();
        let start = match (&params.start_index, &params.start_id) {
            (Some(start), _) => *start,
            (None, Some(id)) => data
                .iter()
                .position(|item| item.get("id").map(|v| v.to_string()).as_deref() == Some(id.as_str()))
                .unwrap_or(total),
            (None, None) => 0,
        };
        let size = if params.all {
            total
        } else {
            params.fetch_size.unwrap_or(total)
        };
        let end = start.saturating_add(size).min(total);
        let items: Vec<Value> = data.get(start.min(total)..end).unwrap_or_default().to_vec();

        let mut envelope = Map::new();
        envelope.insert("offset".into(), json!(start));
        envelope.insert("limit".into(), json!(size));
        envelope.insert("count".into(), json!(items.len()));
        if self.report_total {
            envelope.insert("totalResults".into(), json!(total));
        } else {
            envelope.insert("hasMore".into(), json!(end < total));
        }
        envelope.insert("items".into(), Value::Array(items));
        Value::Object(envelope)
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl SyncAdapter for MockServer {
    async fn sync(&self, request: SyncRequest) -> Result<Value, SyncError> {
        self.requests
            .lock()
            .push((request.method, request.params.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }

        match request.method {
            SyncMethod::Read => Ok(self.read(&request.params)),
            SyncMethod::Create => {
                let mut next = self.next_id.lock();
                let id = *next;
                *next += 1;
                let mut body = request.payload.unwrap_or_else(|| json!({}));
                body["id"] = json!(id);
                self.data.lock().push(body);
                Ok(json!({ "id": id }))
            }
            SyncMethod::Update | SyncMethod::Patch => Ok(json!({})),
            SyncMethod::Delete => {
                let id = request.url.rsplit('/').next().unwrap_or_default().to_string();
                self.data
                    .lock()
                    .retain(|item| item.get("id").map(|v| v.to_string()) != Some(id.clone()));
                Ok(Value::Null)
            }
        }
    }
}

/// A virtualized store over `server`.
pub fn virtual_store(server: &Arc<MockServer>, fetch_size: usize) -> Store {
    Store::new(
        StoreConfig::new()
            .with_url("/items")
            .with_fetch_size(fetch_size)
            .with_adapter(Arc::clone(server) as Arc<dyn SyncAdapter>),
    )
}

/// A store that fetches everything at once from `server`.
pub fn plain_store(server: &Arc<MockServer>) -> Store {
    Store::new(
        StoreConfig::new()
            .with_url("/items")
            .with_adapter(Arc::clone(server) as Arc<dyn SyncAdapter>),
    )
}

/// Records the name of every store event.
pub fn event_log(store: &Store) -> Arc<Mutex<Vec<String>>> {
    use recordset_engine::Event;
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    store.on(ALL, move |event: &StoreEvent| {
        l.lock().push(event.name().into_owned());
    });
    log
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
