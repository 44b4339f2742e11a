//! Integration tests for remote and virtualized stores.
//!
//! Every store here talks to an in-memory paging server (`common::MockServer`).

mod common;

use common::{event_log, init_tracing, plain_store, virtual_store, MockServer};
use futures::FutureExt;
use recordset_engine::{
    adapter_fn, AddOptions, Comparator, Criteria, DestroyOptions, Error, FetchOptions, Observable,
    Query, SaveOptions, SortOptions, Store, StoreConfig, StoreEvent, SyncError, SyncMethod,
    SyncRequest,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn ids(records: &[recordset_engine::Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| r.id().map(|id| id.to_string()))
        .collect()
}

fn position(log: &[String], name: &str) -> usize {
    log.iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("no {name} event in {log:?}"))
}

// ============================================================================
// Range loading
// ============================================================================

#[tokio::test]
async fn range_is_fetched_once() {
    init_tracing();
    let server = MockServer::with_items(100);
    let store = virtual_store(&server, 20);

    let range = store.set_range_local(0, 20).await.unwrap();
    assert_eq!(range.len(), 20);
    assert_eq!(store.len(), 100);
    assert_eq!(store.total_results(), Some(100));
    assert!(store.has_more());

    let again = store.set_range_local(0, 20).await.unwrap();
    assert_eq!(again.len(), 20);
    assert_eq!(server.read_count(), 1);
    assert_eq!(ids(&again.records), ids(&range.records));
}

#[tokio::test]
async fn range_spanning_pages_uses_one_request() {
    let server = MockServer::with_items(100);
    let store = virtual_store(&server, 20);

    let range = store.set_range_local(10, 50).await.unwrap();
    assert_eq!(range.start, 10);
    assert_eq!(range.len(), 50);
    assert_eq!(range.end(), 60);

    let reads = server.reads();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].start_index, Some(10));
    assert_eq!(reads[0].fetch_size, Some(50));
    assert!(store.is_range_local(10, 50));
    assert!(!store.is_range_local(0, 10));
}

#[tokio::test]
async fn range_past_the_end_is_truncated() {
    let server = MockServer::with_items(100);
    let store = virtual_store(&server, 20);

    let range = store.set_range_local(90, 20).await.unwrap();
    assert_eq!(range.len(), 10);
    assert!(!store.has_more());

    let again = store.set_range_local(90, 20).await.unwrap();
    assert_eq!(again.len(), 10);
    assert_eq!(server.read_count(), 1);
}

#[tokio::test]
async fn unknown_total_is_learned_at_the_end() {
    let server = MockServer::without_total(25);
    let store = virtual_store(&server, 10);

    store.set_range_local(0, 10).await.unwrap();
    assert_eq!(store.total_results(), None);
    assert!(store.has_more());

    let second = store.next_page().await.unwrap();
    assert_eq!(second.start, 10);
    assert_eq!(second.len(), 10);

    let last = store.next_page().await.unwrap();
    assert_eq!(last.start, 20);
    assert_eq!(last.len(), 5);
    assert!(!store.has_more());
    assert_eq!(store.total_results(), Some(25));
    assert_eq!(store.len(), 25);
}

#[tokio::test]
async fn pages_step_forward_and_back() {
    let server = MockServer::with_items(100);
    let store = virtual_store(&server, 10);

    store.set_range_local(0, 10).await.unwrap();
    let next = store.next_page().await.unwrap();
    assert_eq!(next.start, 10);
    assert_eq!(ids(&next.records).first().map(String::as_str), Some("10"));

    let back = store.previous_page().await.unwrap();
    assert_eq!(back.start, 0);
    assert_eq!(back.len(), 10);
    // page 0 was still resident
    assert_eq!(server.read_count(), 2);

    let clamped = store.previous_page().await.unwrap();
    assert_eq!(clamped.start, 0);
}

#[tokio::test]
async fn async_lookup_fetches_missing_records() {
    let server = MockServer::with_items(100);
    let store = virtual_store(&server, 10);

    let at = store.at_async(55).await.unwrap().unwrap();
    assert_eq!(at.id().map(|id| id.to_string()), Some("55".to_string()));
    assert_eq!(store.index_of(&at), Some(55));

    let by_id = store.get_async(73).await.unwrap().unwrap();
    assert_eq!(by_id.get("name"), Some(json!("item 073")));
    let start_id = server.reads().pop().and_then(|p| p.start_id);
    assert_eq!(start_id.map(|id| id.to_string()), Some("73".to_string()));

    // already resident: no request
    let again = store.get_async(73).await.unwrap().unwrap();
    assert!(again.ptr_eq(&by_id));
    assert_eq!(server.read_count(), 2);
}

#[tokio::test]
async fn async_lookup_past_the_known_total_fails() {
    let server = MockServer::with_items(30);
    let store = virtual_store(&server, 10);
    store.set_range_local(0, 10).await.unwrap();
    assert_eq!(store.total_results(), Some(30));

    assert_eq!(
        store.at_async(30).await,
        Err(Error::IndexOutOfRange { index: 30, len: 30 })
    );
    assert_eq!(server.read_count(), 1);

    let plain = Store::with_entries(StoreConfig::new(), [json!({"id": 1})]);
    assert!(matches!(
        plain.at_async(1).await,
        Err(Error::IndexOutOfRange { index: 1, len: 1 })
    ));
}

// ============================================================================
// Residency
// ============================================================================

#[tokio::test]
async fn eviction_leaves_holes_at_stable_positions() {
    let server = MockServer::with_items(100);
    let store = Store::new(
        StoreConfig::new()
            .with_url("/items")
            .with_fetch_size(10)
            .with_model_limit(20)
            .with_adapter(Arc::clone(&server) as Arc<dyn recordset_engine::SyncAdapter>),
    );

    store.set_range_local(0, 10).await.unwrap();
    store.set_range_local(10, 10).await.unwrap();
    store.set_range_local(20, 10).await.unwrap();

    assert_eq!(store.resident_count(), 20);
    assert_eq!(store.len(), 100);
    assert!(store.at(0).is_none());
    assert!(store.at(9).is_none());
    let kept = store.at(15).unwrap();
    assert_eq!(kept.id().map(|id| id.to_string()), Some("15".to_string()));
    assert_eq!(store.first_missing(0), Some(0));

    store.set_range_local(0, 10).await.unwrap();
    assert_eq!(server.read_count(), 4);
    assert_eq!(store.resident_count(), 20);
    assert_eq!(store.index_of(&store.at(5).unwrap()), Some(5));
}

#[tokio::test]
async fn filling_a_range_keeps_its_resident_prefix() {
    let server = MockServer::with_items(100);
    let store = Store::new(
        StoreConfig::new()
            .with_url("/items")
            .with_fetch_size(10)
            .with_model_limit(20)
            .with_adapter(Arc::clone(&server) as Arc<dyn recordset_engine::SyncAdapter>),
    );
    store.set_range_local(0, 10).await.unwrap();
    store.set_range_local(50, 10).await.unwrap();
    assert_eq!(store.resident_count(), 20);

    // 5..10 is resident but older than 50..60
    let range = store.set_range_local(5, 15).await.unwrap();

    assert_eq!(range.records.len(), 15);
    assert_eq!(server.read_count(), 3);
    assert!(store.is_range_local(5, 15));
    assert_eq!(store.resident_count(), 20);
}

#[tokio::test]
async fn dirty_records_survive_eviction() {
    let server = MockServer::with_items(100);
    let store = Store::new(
        StoreConfig::new()
            .with_url("/items")
            .with_fetch_size(10)
            .with_model_limit(10)
            .with_adapter(Arc::clone(&server) as Arc<dyn recordset_engine::SyncAdapter>),
    );

    store.set_range_local(0, 10).await.unwrap();
    let edited = store.at(3).unwrap();
    edited.set("name", json!("edited"));

    store.set_range_local(10, 10).await.unwrap();
    store.set_range_local(20, 10).await.unwrap();

    assert!(store.at(3).is_some_and(|r| r.ptr_eq(&edited)));
    assert_eq!(store.resident_count(), 10);
    assert!(store.at(2).is_none());
}

// ============================================================================
// Sequencing
// ============================================================================

#[tokio::test]
async fn operations_run_in_issue_order() {
    let server = MockServer::with_items(100);
    let store = virtual_store(&server, 20);
    store.set_range_local(0, 20).await.unwrap();

    let log = event_log(&store);
    let added = store.add_async([json!({"id": "new"})], AddOptions::default());
    let sorted = store.sort_async(SortOptions::default());
    sorted.await.unwrap();
    added.await.unwrap();

    let log = log.lock().clone();
    let alladded = position(&log, "alladded");
    let sort = position(&log, "sort");
    let request = position(&log, "request");
    assert!(alladded < sort, "{log:?}");
    assert!(sort < request, "{log:?}");
}

#[tokio::test]
async fn async_add_grows_the_virtual_total() {
    let server = MockServer::with_items(100);
    let store = virtual_store(&server, 20);

    let range = store.set_range_local(0, 20);
    let added = store.add_async([json!({"id": "extra"})], AddOptions::default());
    range.await.unwrap();
    let records = added.await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(store.len(), 101);
    assert_eq!(store.total_results(), Some(101));
    assert_eq!(store.index_of(&records[0]), Some(100));

    let removed = store
        .remove_async(["extra"], Default::default())
        .await
        .unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(store.total_results(), Some(100));
}

#[tokio::test]
async fn synchronous_mutation_is_rejected_when_virtualized() {
    let server = MockServer::with_items(10);
    let store = virtual_store(&server, 5);
    assert_eq!(
        store.add([json!({"id": 1})], AddOptions::default()),
        Err(Error::VirtualizedStore("add"))
    );
    assert!(matches!(
        store.sort(SortOptions::default()),
        Err(Error::VirtualizedStore(_))
    ));
}

#[tokio::test]
async fn ready_fires_when_drained() {
    let server = MockServer::with_items(30);
    let store = virtual_store(&server, 10);
    let log = event_log(&store);

    let first = store.set_range_local(0, 10);
    let second = store.set_range_local(10, 10);
    assert!(store.pending_operations() > 0);
    first.await.unwrap();
    second.await.unwrap();
    store.when_ready().await;

    assert_eq!(store.pending_operations(), 0);
    let log = log.lock();
    assert_eq!(log.iter().filter(|n| *n == "ready").count(), 1);
    assert_eq!(log.last().map(String::as_str), Some("ready"));
}

#[tokio::test]
async fn abort_cancels_outstanding_request() {
    let server = MockServer::slow(100, Duration::from_millis(500));
    let store = virtual_store(&server, 10);
    let errors = Arc::new(parking_lot::Mutex::new(Vec::<SyncError>::new()));
    let e = Arc::clone(&errors);
    store.on("error", move |event: &StoreEvent| {
        if let StoreEvent::Error { error, .. } = event {
            e.lock().push(error.clone());
        }
    });

    let range = store.set_range_local(0, 10);
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.abort().await;

    assert_eq!(range.await, Err(Error::Aborted));
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_aborted());
    assert_eq!(store.resident_count(), 0);
}

#[tokio::test]
async fn abort_cancels_outstanding_create() {
    let server = MockServer::slow(0, Duration::from_millis(400));
    let store = plain_store(&server);

    let created = store.create(json!({"name": "x"}), SaveOptions::default());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = std::time::Instant::now();
    store.abort().await;

    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(created.await.err(), Some(Error::Aborted));
    assert!(server.data.lock().is_empty());
}

#[tokio::test]
async fn abort_cancels_requests_of_owned_records() {
    let server = MockServer::slow(0, Duration::from_millis(400));
    let store = plain_store(&server);
    let record = store.push(json!({"id": 4, "name": "kept"})).unwrap().unwrap();
    let errors = event_log(&store);

    let saving = {
        let record = record.clone();
        tokio::spawn(async move {
            record
                .save(serde_json::Map::new(), SaveOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.abort().await;

    assert_eq!(saving.await.unwrap().err(), Some(Error::Aborted));
    assert!(errors.lock().iter().any(|name| name == "error"));
}

// ============================================================================
// Sorting
// ============================================================================

#[tokio::test]
async fn virtual_sort_refills_in_server_order() {
    let server = MockServer::with_items(50);
    let store = Store::new(
        StoreConfig::new()
            .with_url("/items")
            .with_fetch_size(10)
            .with_comparator("rank")
            .with_adapter(Arc::clone(&server) as Arc<dyn recordset_engine::SyncAdapter>),
    );

    store.set_range_local(0, 10).await.unwrap();
    assert_eq!(store.at(0).unwrap().get("rank"), Some(json!(1)));

    store.set_sort_direction(recordset_engine::SortDirection::Descending);
    store.sort_async(SortOptions::default()).await.unwrap();
    assert_eq!(store.at(0).unwrap().get("rank"), Some(json!(50)));
    assert_eq!(store.len(), 50);

    let last = server.reads().pop().unwrap();
    assert_eq!(last.sort.as_deref(), Some("rank"));
    assert_eq!(last.sort_dir, Some(recordset_engine::SortDirection::Descending));
}

#[tokio::test]
async fn function_comparator_cannot_sort_virtually() {
    let server = MockServer::with_items(10);
    let store = Store::new(
        StoreConfig::new()
            .with_url("/items")
            .with_fetch_size(5)
            .with_comparator(Comparator::key(|r| r.get("rank").unwrap_or(Value::Null)))
            .with_adapter(Arc::clone(&server) as Arc<dyn recordset_engine::SyncAdapter>),
    );
    let result = store.sort_async(SortOptions::default()).await;
    assert!(matches!(result, Err(Error::UnsupportedComparator(_))));
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn server_query_results_stay_detached() {
    let server = MockServer::with_items(20);
    let store = virtual_store(&server, 5);

    let query = Query::from(Criteria::new().eq("dept", json!("odd")));
    let matches = store.where_async(query).await.unwrap();

    assert_eq!(matches.len(), 10);
    assert!(matches.iter().all(|r| r.owner().is_none()));
    assert_eq!(store.resident_count(), 0);
    let reads = server.reads();
    assert_eq!(reads[0].query.as_deref(), Some("dept=odd"));
    assert!(reads[0].all);
}

#[tokio::test]
async fn server_query_values_keep_their_separators() {
    let server = MockServer::with_items(0);
    server.data.lock().extend([
        json!({"id": 1, "name": "a,b=c"}),
        json!({"id": 2, "name": "a"}),
        json!({"id": 3, "b": "c"}),
    ]);
    let store = virtual_store(&server, 5);

    let query = Query::from(Criteria::new().eq("name", json!("a,b=c")));
    let matches = store.where_async(query).await.unwrap();

    assert_eq!(ids(&matches), vec!["1"]);
    assert_eq!(server.reads()[0].query.as_deref(), Some("name=a%2Cb%3Dc"));
}

#[tokio::test]
async fn local_query_on_plain_store() {
    let server = MockServer::with_items(6);
    let store = plain_store(&server);
    store.fetch(FetchOptions::default()).await.unwrap();

    let attrs = json!({"dept": "even"}).as_object().cloned().unwrap();
    let matches = store.where_async(attrs).await.unwrap();
    assert_eq!(ids(&matches), vec!["0", "2", "4"]);
    assert_eq!(server.read_count(), 1);
}

// ============================================================================
// Non-virtualized remote stores
// ============================================================================

#[tokio::test]
async fn fetch_reconciles_contents() {
    let server = MockServer::with_items(5);
    let store = plain_store(&server);

    let first = store.fetch(FetchOptions::default()).await.unwrap();
    assert_eq!(first.len(), 5);
    assert!(server.reads()[0].all);
    let kept = store.get(2).unwrap();

    {
        let mut data = server.data.lock();
        data.remove(0);
        data.push(json!({"id": 99, "name": "late"}));
    }
    let log = event_log(&store);
    store.fetch(FetchOptions::default()).await.unwrap();

    assert_eq!(ids(&store.records()), vec!["1", "2", "3", "4", "99"]);
    assert!(store.get(2).unwrap().ptr_eq(&kept));
    let log = log.lock().clone();
    assert!(position(&log, "request") < position(&log, "remove"));
    assert!(position(&log, "allremoved") < position(&log, "add"));
    assert!(position(&log, "alladded") < position(&log, "sync"));
}

#[tokio::test]
async fn fetch_with_reset_replaces_contents() {
    let server = MockServer::with_items(3);
    let store = plain_store(&server);
    store.fetch(FetchOptions::default()).await.unwrap();
    let before = store.get(0).unwrap();

    let log = event_log(&store);
    store.fetch(FetchOptions::reset()).await.unwrap();
    assert_eq!(store.len(), 3);
    assert!(!store.get(0).unwrap().ptr_eq(&before));
    assert!(log.lock().contains(&"reset".to_string()));
}

#[tokio::test]
async fn refresh_without_url_is_a_no_op() {
    let store = Store::new(StoreConfig::new());
    store.push(json!({"id": 1})).unwrap();
    let refreshed = store.refresh().await.unwrap();
    assert!(refreshed.is_empty());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn missing_adapter_fails_before_request() {
    let store = Store::new(StoreConfig::new().with_url("/items"));
    let log = event_log(&store);
    let result = store.fetch(FetchOptions::default()).await;
    assert_eq!(result, Err(Error::MissingAdapter));
    assert!(!log.lock().contains(&"request".to_string()));
}

#[tokio::test]
async fn server_failure_is_reported() {
    let server = MockServer::with_items(5);
    *server.fail_with.lock() = Some(SyncError::new(503, "unavailable"));
    let store = plain_store(&server);
    let log = event_log(&store);

    let result = store.fetch(FetchOptions::default()).await;
    assert!(matches!(result, Err(Error::Sync(e)) if e.status == 503));
    let log = log.lock().clone();
    assert!(position(&log, "request") < position(&log, "error"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn error_event_carries_request_params() {
    let server = MockServer::with_items(50);
    *server.fail_with.lock() = Some(SyncError::new(500, "boom"));
    let store = virtual_store(&server, 10);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    store.on("error", move |event: &StoreEvent| {
        if let StoreEvent::Error { method, params, error } = event {
            s.lock().push((*method, params.clone(), error.status));
        }
    });

    assert!(store.set_range_local(20, 10).await.is_err());

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    let (method, params, status) = &seen[0];
    assert_eq!(*method, SyncMethod::Read);
    assert_eq!(params.start_index, Some(20));
    assert_eq!(params.fetch_size, Some(10));
    assert_eq!(*status, 500);
}

// ============================================================================
// Record persistence through a store
// ============================================================================

#[tokio::test]
async fn create_with_wait_joins_after_success() {
    let server = MockServer::with_items(0);
    let store = plain_store(&server);

    let record = store
        .create(json!({"name": "fresh"}), SaveOptions::wait())
        .await
        .unwrap();
    assert_eq!(record.id().map(|id| id.to_string()), Some("0".to_string()));
    assert_eq!(store.len(), 1);
    assert_eq!(record.owner(), Some(store.id()));
    assert_eq!(server.data.lock().len(), 1);
    assert!(server
        .requests
        .lock()
        .iter()
        .any(|(m, _)| *m == SyncMethod::Create));
}

#[tokio::test]
async fn failed_create_with_wait_never_joins() {
    let server = MockServer::with_items(0);
    *server.fail_with.lock() = Some(SyncError::new(422, "rejected"));
    let store = plain_store(&server);

    let result = store.create(json!({"name": "bad"}), SaveOptions::wait()).await;
    assert!(result.is_err());
    assert!(store.is_empty());
}

#[tokio::test]
async fn destroy_removes_from_store_and_server() {
    let server = MockServer::with_items(3);
    let store = plain_store(&server);
    store.fetch(FetchOptions::default()).await.unwrap();

    let doomed = store.get(1).unwrap();
    doomed.destroy(DestroyOptions::default()).await.unwrap();

    assert_eq!(ids(&store.records()), vec!["0", "2"]);
    assert_eq!(server.data.lock().len(), 2);
    assert!(doomed.owner().is_none());
}

// ============================================================================
// Data quirks
// ============================================================================

#[tokio::test]
async fn duplicate_ids_are_placed_anyway() {
    let adapter = adapter_fn(|_request: SyncRequest| {
        async move {
            Ok::<Value, SyncError>(json!({
                "items": [{"id": 1, "n": "a"}, {"id": 1, "n": "b"}],
                "offset": 0,
                "totalResults": 2
            }))
        }
        .boxed()
    });
    let store = Store::new(
        StoreConfig::new()
            .with_url("/dupes")
            .with_fetch_size(2)
            .with_adapter(Arc::new(adapter)),
    );

    let range = store.set_range_local(0, 2).await.unwrap();
    assert_eq!(range.len(), 2);
    assert_eq!(store.resident_count(), 2);
    assert_eq!(store.at(1).unwrap().get("n"), Some(json!("b")));
}

#[tokio::test]
async fn bare_array_response_is_accepted() {
    let adapter = adapter_fn(|_request: SyncRequest| {
        async move { Ok::<Value, SyncError>(json!([{"id": "a"}, {"id": "b"}])) }.boxed()
    });
    let store = Store::new(
        StoreConfig::new()
            .with_url("/plain")
            .with_adapter(Arc::new(adapter)),
    );
    let records = store.fetch(FetchOptions::default()).await.unwrap();
    assert_eq!(ids(&records), vec!["a", "b"]);
    assert_eq!(store.total_results(), Some(2));
}
