//! Store - the ordered, possibly sparse record container.
//!
//! A [`Store`] holds records at stable positions. When virtualized (a fetch
//! size is configured) positions not fetched yet are holes, and the store
//! may be pre-sized to the server's total. Resident records are threaded
//! through an LRU chain; when a model limit is set the least recently used
//! clean records are evicted before insertions would exceed it.
//!
//! Synchronous operations run to completion under the store lock. Their
//! `_async` counterparts and every remote operation go through the store's
//! [`Sequencer`] (see `remote.rs`). Events are collected while the lock is
//! held and emitted after it is released, so listeners may call back into
//! the store.

use crate::{
    comparator::{Comparator, SortDirection},
    config::StoreConfig,
    error::Result,
    events::{Event, EventEmitter, ListenerId, Observable, ALL},
    lru::LruChain,
    paging::PagingState,
    query::Query,
    record::{ClientId, RecordEvent, RecordKey, SetOptions, StoreLink},
    sequencer::Sequencer,
    sync::{FetchParams, RequestSet, SyncAdapter, SyncError, SyncMethod},
    value::compare_values,
    Attributes, Error, Record,
};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Input to insertion: an existing record or raw attributes.
#[derive(Debug, Clone)]
pub enum Entry {
    Record(Record),
    Raw(Value),
}

impl From<Record> for Entry {
    fn from(record: Record) -> Self {
        Entry::Record(record)
    }
}

impl From<&Record> for Entry {
    fn from(record: &Record) -> Self {
        Entry::Record(record.clone())
    }
}

impl From<Value> for Entry {
    fn from(value: Value) -> Self {
        Entry::Raw(value)
    }
}

impl From<Attributes> for Entry {
    fn from(attrs: Attributes) -> Self {
        Entry::Raw(Value::Object(attrs))
    }
}

/// Options for [`Store::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOptions {
    /// Insert at this position instead of appending
    pub at: Option<usize>,
    /// Merge attributes into an existing record with the same identity
    pub merge: bool,
    /// Insert even when a record with the same identity exists
    pub force: bool,
    pub silent: bool,
    /// Re-sort after insertion when a comparator is set
    pub sort: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            at: None,
            merge: false,
            force: false,
            silent: false,
            sort: true,
        }
    }
}

impl AddOptions {
    pub fn merge() -> Self {
        Self {
            merge: true,
            ..Self::default()
        }
    }

    pub fn at(index: usize) -> Self {
        Self {
            at: Some(index),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub silent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortOptions {
    pub silent: bool,
    /// First position to re-fetch after a virtualized sort
    pub start_index: usize,
}

/// A contiguous run of resident records.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRange {
    pub start: usize,
    pub records: Vec<Record>,
}

impl LocalRange {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position one past the last record.
    pub fn end(&self) -> usize {
        self.start + self.records.len()
    }
}

/// Events emitted by a store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Add { record: Record, index: usize },
    /// Once per insertion batch that added or merged at least one record
    AllAdded { records: Vec<Record> },
    Remove { record: Record, index: usize },
    AllRemoved { records: Vec<Record> },
    Reset { previous: Vec<Record> },
    Sort,
    Request { method: SyncMethod, params: FetchParams },
    Sync { method: SyncMethod, response: Value },
    Error {
        method: SyncMethod,
        params: FetchParams,
        error: SyncError,
    },
    /// The sequencer drained
    Ready,
    /// A record event, delivered under the record event's own name
    Record(RecordEvent),
}

impl Event for StoreEvent {
    fn name(&self) -> Cow<'_, str> {
        match self {
            StoreEvent::Add { .. } => Cow::Borrowed("add"),
            StoreEvent::AllAdded { .. } => Cow::Borrowed("alladded"),
            StoreEvent::Remove { .. } => Cow::Borrowed("remove"),
            StoreEvent::AllRemoved { .. } => Cow::Borrowed("allremoved"),
            StoreEvent::Reset { .. } => Cow::Borrowed("reset"),
            StoreEvent::Sort => Cow::Borrowed("sort"),
            StoreEvent::Request { .. } => Cow::Borrowed("request"),
            StoreEvent::Sync { .. } => Cow::Borrowed("sync"),
            StoreEvent::Error { .. } => Cow::Borrowed("error"),
            StoreEvent::Ready => Cow::Borrowed("ready"),
            StoreEvent::Record(event) => event.name(),
        }
    }
}

/// Mutable store state, guarded by the store lock.
pub(crate) struct StoreState {
    pub(crate) slots: Vec<Option<Record>>,
    /// Positions holding a record
    pub(crate) resident: BTreeSet<usize>,
    pub(crate) lru: LruChain<ClientId>,
    pub(crate) paging: PagingState,
    pub(crate) fetch_size: Option<usize>,
    pub(crate) model_limit: Option<usize>,
    pub(crate) comparator: Option<Comparator>,
    pub(crate) sort_direction: SortDirection,
    /// Start of the most recently requested range
    pub(crate) cursor: usize,
    subscriptions: HashMap<ClientId, ListenerId>,
}

impl StoreState {
    fn new(config: &StoreConfig) -> Self {
        Self {
            slots: Vec::new(),
            resident: BTreeSet::new(),
            lru: LruChain::new(),
            paging: PagingState::default(),
            fetch_size: config.fetch_size,
            model_limit: config.model_limit,
            comparator: config.comparator.clone(),
            sort_direction: config.sort_direction,
            cursor: 0,
            subscriptions: HashMap::new(),
        }
    }

    pub(crate) fn is_virtual(&self) -> bool {
        self.fetch_size.is_some()
    }

    pub(crate) fn record_at(&self, index: usize) -> Option<&Record> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn resident_records(&self) -> Vec<Record> {
        self.resident
            .iter()
            .filter_map(|&i| self.record_at(i).cloned())
            .collect()
    }

    pub(crate) fn position_of(&self, client_id: ClientId) -> Option<usize> {
        self.resident
            .iter()
            .copied()
            .find(|&i| self.record_at(i).is_some_and(|r| r.client_id() == client_id))
    }

    /// Position of the record designated by `key`: id matches win over
    /// client id matches.
    pub(crate) fn position_of_key(&self, key: &RecordKey) -> Option<usize> {
        if let Some(id) = &key.id {
            let by_id = self.resident.iter().copied().find(|&i| {
                self.record_at(i)
                    .is_some_and(|r| r.id().as_ref() == Some(id))
            });
            if by_id.is_some() {
                return by_id;
            }
        }
        key.client_id.and_then(|cid| self.position_of(cid))
    }

    pub(crate) fn touch(&mut self, client_id: ClientId) {
        if self.lru.contains(&client_id) {
            self.lru.touch(client_id);
        }
    }

    /// Insert at `index`, shifting later positions up.
    pub(crate) fn insert_at(&mut self, index: usize, record: Record, track: bool) -> usize {
        let index = index.min(self.slots.len());
        let client_id = record.client_id();
        self.slots.insert(index, Some(record));
        self.resident = self
            .resident
            .iter()
            .map(|&p| if p >= index { p + 1 } else { p })
            .collect();
        self.resident.insert(index);
        if track {
            self.lru.touch(client_id);
        }
        index
    }

    /// Put `record` into the slot at `index` without shifting, growing the
    /// slots if needed. Returns the record it displaced.
    pub(crate) fn place_at(&mut self, index: usize, record: Record, track: bool) -> Option<Record> {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        let client_id = record.client_id();
        let displaced = self.slots[index].replace(record);
        if let Some(old) = &displaced {
            self.lru.remove(&old.client_id());
        }
        self.resident.insert(index);
        if track {
            self.lru.touch(client_id);
        }
        displaced
    }

    /// Splice out the slot at `index`, shifting later positions down.
    pub(crate) fn remove_at(&mut self, index: usize) -> Option<Record> {
        if index >= self.slots.len() {
            return None;
        }
        let removed = self.slots.remove(index);
        self.resident = self
            .resident
            .iter()
            .filter(|&&p| p != index)
            .map(|&p| if p > index { p - 1 } else { p })
            .collect();
        if let Some(record) = &removed {
            self.lru.remove(&record.client_id());
        }
        removed
    }

    /// Turn the slot at `index` into a hole.
    pub(crate) fn evict_at(&mut self, index: usize) -> Option<Record> {
        let record = self.slots.get_mut(index)?.take()?;
        self.resident.remove(&index);
        self.lru.remove(&record.client_id());
        Some(record)
    }

    /// Resize to `len` slots, returning records cut off the end.
    pub(crate) fn resize(&mut self, len: usize) -> Vec<Record> {
        let mut cut = Vec::new();
        if len < self.slots.len() {
            for index in len..self.slots.len() {
                if let Some(record) = self.evict_at(index) {
                    cut.push(record);
                }
            }
        }
        self.slots.resize(len, None);
        cut
    }

    /// Drop every record, leaving `len` holes.
    pub(crate) fn clear(&mut self, len: usize) -> Vec<Record> {
        let records = self.resident_records();
        self.slots = vec![None; len];
        self.resident.clear();
        self.lru.clear();
        records
    }

    /// Evict enough least recently used clean records for `incoming` new
    /// ones to fit under the model limit. Records with unsaved changes are
    /// skipped; the walk continues past them until enough are found or the
    /// chain is exhausted.
    pub(crate) fn make_room(&mut self, incoming: usize) -> Vec<Record> {
        let Some(limit) = self.model_limit else {
            return Vec::new();
        };
        let resident = self.resident.len();
        if resident + incoming <= limit {
            return Vec::new();
        }
        let mut needed = resident + incoming - limit;
        let mut evicted = Vec::new();
        let candidates: Vec<ClientId> = self.lru.iter_from_tail().collect();
        for client_id in candidates {
            if needed == 0 {
                break;
            }
            let Some(index) = self.position_of(client_id) else {
                self.lru.remove(&client_id);
                continue;
            };
            let dirty = self.record_at(index).is_some_and(|r| r.has_changed(None));
            if dirty {
                tracing::trace!(%client_id, index, "lru: skipping record with unsaved changes");
                continue;
            }
            if let Some(record) = self.evict_at(index) {
                tracing::trace!(%client_id, index, "lru: evicted");
                evicted.push(record);
                needed -= 1;
            }
        }
        evicted
    }

    /// Reorder resident records by the comparator, keeping hole positions.
    pub(crate) fn sort_resident(&mut self) -> bool {
        let Some(comparator) = self.comparator.clone() else {
            return false;
        };
        let positions: Vec<usize> = self.resident.iter().copied().collect();
        let mut records = self.resident_records();
        comparator.sort(&mut records, self.sort_direction);
        for (index, record) in positions.into_iter().zip(records) {
            self.slots[index] = Some(record);
        }
        true
    }

    /// Total number of records: the slot count when everything is local,
    /// the server's total when virtualized.
    pub(crate) fn total_results(&self) -> Option<usize> {
        if self.is_virtual() {
            self.paging.total_results
        } else {
            Some(self.slots.len())
        }
    }

    pub(crate) fn adjust_total(&mut self, grow: bool) {
        if !self.is_virtual() {
            return;
        }
        if let Some(total) = self.paging.total_results.as_mut() {
            *total = if grow {
                *total + 1
            } else {
                total.saturating_sub(1)
            };
        }
    }

    pub(crate) fn local_range(&self, start: usize, count: usize) -> Vec<Record> {
        (start..start.saturating_add(count))
            .map_while(|i| self.record_at(i).cloned())
            .collect()
    }
}

pub(crate) struct Candidate {
    pub(crate) record: Record,
    /// Attributes as supplied, for merging without defaults
    raw: Option<Attributes>,
}

impl Candidate {
    pub(crate) fn attributes(&self) -> Attributes {
        self.raw.clone().unwrap_or_else(|| self.record.attributes())
    }
}

pub(crate) struct StoreInner {
    id: u64,
    pub(crate) config: StoreConfig,
    pub(crate) state: RwLock<StoreState>,
    pub(crate) events: EventEmitter<StoreEvent>,
    pub(crate) sequencer: Sequencer,
    pub(crate) requests: Arc<RequestSet>,
}

/// Ordered record store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        let inner = Arc::new(StoreInner {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            state: RwLock::new(StoreState::new(&config)),
            config,
            events: EventEmitter::new(),
            sequencer: Sequencer::new(),
            requests: Arc::new(RequestSet::default()),
        });
        let weak: Weak<StoreInner> = Arc::downgrade(&inner);
        inner.sequencer.set_idle_hook(move || {
            if let Some(inner) = weak.upgrade() {
                inner.events.trigger(&StoreEvent::Ready);
            }
        });
        Self { inner }
    }

    /// Create a store holding `entries`, silently.
    pub fn with_entries<I>(config: StoreConfig, entries: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        let store = Self::new(config);
        store.add_internal(
            entries.into_iter().map(Into::into).collect(),
            AddOptions {
                silent: true,
                ..AddOptions::default()
            },
        );
        store
    }

    /// Opaque identity, as reported by [`Record::owner`].
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn url(&self) -> Option<&str> {
        self.inner.config.url.as_deref()
    }

    pub(crate) fn adapter(&self) -> Option<Arc<dyn SyncAdapter>> {
        self.inner
            .config
            .adapter
            .clone()
            .or_else(|| self.inner.config.record.adapter.clone())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner.state.write()
    }

    /// Whether a fetch size is configured.
    pub fn is_virtual(&self) -> bool {
        self.inner.state.read().is_virtual()
    }

    /// Number of positions, holes included.
    pub fn len(&self) -> usize {
        self.inner.state.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records held in memory.
    pub fn resident_count(&self) -> usize {
        self.inner.state.read().resident.len()
    }

    pub fn fetch_size(&self) -> Option<usize> {
        self.inner.state.read().fetch_size
    }

    pub fn model_limit(&self) -> Option<usize> {
        self.inner.state.read().model_limit
    }

    pub fn comparator(&self) -> Option<Comparator> {
        self.inner.state.read().comparator.clone()
    }

    pub fn sort_direction(&self) -> SortDirection {
        self.inner.state.read().sort_direction
    }

    pub fn paging(&self) -> PagingState {
        self.inner.state.read().paging.clone()
    }

    pub fn total_results(&self) -> Option<usize> {
        self.inner.state.read().total_results()
    }

    pub fn has_more(&self) -> bool {
        self.inner.state.read().paging.has_more
    }

    /// Record ids from least to most recently used.
    pub fn lru_order(&self) -> Vec<ClientId> {
        self.inner.state.read().lru.iter_from_tail().collect()
    }

    /// Change the page size. `None` turns virtualization off.
    pub fn set_fetch_size(&self, fetch_size: Option<usize>) {
        self.write().fetch_size = fetch_size.filter(|n| *n > 0);
    }

    /// Change the resident limit, evicting immediately when lowered.
    pub fn set_model_limit(&self, model_limit: Option<usize>) {
        let mut state = self.write();
        state.model_limit = model_limit;
        let evicted = state.make_room(0);
        for record in &evicted {
            self.release(&mut state, record);
        }
    }

    pub fn set_comparator(&self, comparator: Option<Comparator>) {
        self.write().comparator = comparator;
    }

    pub fn set_sort_direction(&self, direction: SortDirection) {
        self.write().sort_direction = direction;
    }

    pub(crate) fn link(&self) -> StoreLink {
        StoreLink {
            store_id: self.inner.id,
            url: self.inner.config.url.clone(),
            adapter: self.adapter(),
            requests: Arc::clone(&self.inner.requests),
        }
    }

    /// Take ownership of `record` and forward its events. Returns whether
    /// ownership was granted; a record owned by another store keeps its
    /// owner and stays out of this store's LRU chain.
    pub(crate) fn adopt(&self, state: &mut StoreState, record: &Record) -> bool {
        let attached = record.attach(self.link());
        let client_id = record.client_id();
        if !state.subscriptions.contains_key(&client_id) {
            let weak = Arc::downgrade(&self.inner);
            let listener = record.on(ALL, move |event: &RecordEvent| {
                if let Some(inner) = weak.upgrade() {
                    Store { inner }.forward(event);
                }
            });
            state.subscriptions.insert(client_id, listener);
        }
        attached
    }

    /// Sever ownership and event forwarding.
    pub(crate) fn release(&self, state: &mut StoreState, record: &Record) {
        record.detach(self.inner.id);
        if let Some(listener) = state.subscriptions.remove(&record.client_id()) {
            record.off(listener);
        }
    }

    fn forward(&self, event: &RecordEvent) {
        if let RecordEvent::Destroy { record } = event {
            self.remove_internal(
                vec![RecordKey::from(record.client_id())],
                RemoveOptions::default(),
            );
        }
        self.inner.events.trigger(&StoreEvent::Record(event.clone()));
    }

    pub(crate) fn emit(&self, events: Vec<StoreEvent>) {
        for event in &events {
            self.inner.events.trigger(event);
        }
    }

    pub(crate) fn ensure_local(&self, operation: &'static str) -> Result<()> {
        if self.is_virtual() {
            Err(Error::VirtualizedStore(operation))
        } else {
            Ok(())
        }
    }

    // ----- access -----

    /// Record at `index`, if resident. Marks it most recently used.
    pub fn at(&self, index: usize) -> Option<Record> {
        let mut state = self.write();
        let record = state.record_at(index).cloned()?;
        state.touch(record.client_id());
        Some(record)
    }

    /// Record by id or client id, if resident. Marks it most recently used.
    pub fn get(&self, key: impl Into<RecordKey>) -> Option<Record> {
        let key = key.into();
        let mut state = self.write();
        let index = state.position_of_key(&key)?;
        let record = state.record_at(index).cloned()?;
        state.touch(record.client_id());
        Some(record)
    }

    pub fn get_by_client_id(&self, client_id: ClientId) -> Option<Record> {
        self.get(client_id)
    }

    pub fn index_of(&self, record: &Record) -> Option<usize> {
        self.inner.state.read().position_of(record.client_id())
    }

    pub fn contains(&self, record: &Record) -> bool {
        self.index_of(record).is_some()
    }

    /// Resident records in position order.
    pub fn records(&self) -> Vec<Record> {
        self.inner.state.read().resident_records()
    }

    /// Every position, `None` for holes.
    pub fn slots(&self) -> Vec<Option<Record>> {
        self.inner.state.read().slots.clone()
    }

    pub fn first(&self, n: usize) -> Vec<Record> {
        self.records().into_iter().take(n).collect()
    }

    pub fn last(&self, n: usize) -> Vec<Record> {
        let records = self.records();
        let skip = records.len().saturating_sub(n);
        records.into_iter().skip(skip).collect()
    }

    /// Resident records with positions in `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> Vec<Record> {
        let state = self.inner.state.read();
        state
            .resident
            .range(start..end.max(start))
            .filter_map(|&i| state.record_at(i).cloned())
            .collect()
    }

    pub fn pluck(&self, attribute: &str) -> Vec<Option<Value>> {
        self.records().iter().map(|r| r.get(attribute)).collect()
    }

    pub fn filter<F>(&self, predicate: F) -> Vec<Record>
    where
        F: Fn(&Record) -> bool,
    {
        self.records().into_iter().filter(|r| predicate(r)).collect()
    }

    /// Resident records matching `query`.
    pub fn where_local(&self, query: impl Into<Query>) -> Result<Vec<Record>> {
        let query = query.into();
        let mut matched = Vec::new();
        for record in self.records() {
            if query.matches(&record)? {
                matched.push(record);
            }
        }
        Ok(matched)
    }

    /// First resident record matching `query`.
    pub fn find_where(&self, query: impl Into<Query>) -> Result<Option<Record>> {
        let query = query.into();
        for record in self.records() {
            if query.matches(&record)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// A new, non-virtualized store sharing configuration and the matching
    /// records. Ownership of the records stays with this store.
    pub fn where_to_store(&self, query: impl Into<Query>) -> Result<Store> {
        let matched = self.where_local(query)?;
        let mut config = self.inner.config.clone();
        config.fetch_size = None;
        config.model_limit = None;
        Ok(Store::with_entries(config, matched))
    }

    pub fn min_by_key<F>(&self, key: F) -> Option<Record>
    where
        F: Fn(&Record) -> Value,
    {
        self.records()
            .into_iter()
            .map(|r| (key(&r), r))
            .min_by(|(a, _), (b, _)| compare_values(Some(a), Some(b)))
            .map(|(_, r)| r)
    }

    pub fn max_by_key<F>(&self, key: F) -> Option<Record>
    where
        F: Fn(&Record) -> Value,
    {
        self.records()
            .into_iter()
            .map(|r| (key(&r), r))
            .max_by(|(a, _), (b, _)| compare_values(Some(a), Some(b)))
            .map(|(_, r)| r)
    }

    /// Insertion point for `record` under the current comparator.
    pub fn sorted_index(&self, record: &Record) -> Result<usize> {
        let state = self.inner.state.read();
        let comparator = state
            .comparator
            .as_ref()
            .ok_or_else(|| Error::UnsupportedComparator("store has no comparator".to_string()))?;
        Ok(comparator.sorted_index(&state.resident_records(), record, state.sort_direction))
    }

    /// First position at or after `start` without a record, bounded by the
    /// known total.
    pub fn first_missing(&self, start: usize) -> Option<usize> {
        let state = self.inner.state.read();
        let end = state.total_results().unwrap_or(usize::MAX);
        (start..end).find(|&i| state.record_at(i).is_none())
    }

    /// Resident run starting at `start`, stopping at the first hole or
    /// after `count` records.
    pub fn local_range(&self, start: usize, count: usize) -> LocalRange {
        LocalRange {
            start,
            records: self.inner.state.read().local_range(start, count),
        }
    }

    /// Whether `start..start + count` is resident, or resident up to the
    /// known end of data.
    pub fn is_range_local(&self, start: usize, count: usize) -> bool {
        let state = self.inner.state.read();
        let end = start + state.local_range(start, count).len();
        if end >= start + count || state.paging.is_past_end(end) {
            return true;
        }
        !state.is_virtual() && end >= state.slots.len()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.records().iter().map(Record::to_json).collect())
    }

    pub fn when_ready(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.inner.sequencer.when_ready()
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.sequencer.pending()
    }

    // ----- mutation -----

    /// Add records. Fails on a virtualized store; use `add_async`.
    pub fn add<I>(&self, entries: I, options: AddOptions) -> Result<Vec<Record>>
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        self.ensure_local("add")?;
        Ok(self.add_internal(entries.into_iter().map(Into::into).collect(), options))
    }

    /// Append one record.
    pub fn push(&self, entry: impl Into<Entry>) -> Result<Option<Record>> {
        Ok(self.add([entry.into()], AddOptions::default())?.pop())
    }

    /// Prepend one record.
    pub fn unshift(&self, entry: impl Into<Entry>) -> Result<Option<Record>> {
        Ok(self.add([entry.into()], AddOptions::at(0))?.pop())
    }

    /// Remove and return the last resident record.
    pub fn pop(&self) -> Result<Option<Record>> {
        self.ensure_local("pop")?;
        let Some(last) = self.records().pop() else {
            return Ok(None);
        };
        Ok(self
            .remove_internal(vec![RecordKey::from(last.client_id())], RemoveOptions::default())
            .pop())
    }

    /// Remove and return the first resident record.
    pub fn shift(&self) -> Result<Option<Record>> {
        self.ensure_local("shift")?;
        let Some(first) = self.records().into_iter().next() else {
            return Ok(None);
        };
        Ok(self
            .remove_internal(vec![RecordKey::from(first.client_id())], RemoveOptions::default())
            .pop())
    }

    pub(crate) fn prepare(&self, entries: Vec<Entry>, silent: bool) -> Vec<Candidate> {
        entries
            .into_iter()
            .filter_map(|entry| {
                let candidate = match entry {
                    Entry::Record(record) => Candidate { record, raw: None },
                    Entry::Raw(value) => Candidate {
                        raw: Some(value.as_object().cloned().unwrap_or_default()),
                        record: Record::with_config(Arc::clone(&self.inner.config.record), value),
                    },
                };
                if candidate.record.is_valid() {
                    return Some(candidate);
                }
                let error = candidate.record.validation_error().unwrap_or(Value::Null);
                tracing::debug!(client_id = %candidate.record.client_id(), "rejected invalid record");
                if !silent {
                    self.inner.events.trigger(&StoreEvent::Record(RecordEvent::Invalid {
                        record: candidate.record,
                        error,
                    }));
                }
                None
            })
            .collect()
    }

    pub(crate) fn add_internal(&self, entries: Vec<Entry>, options: AddOptions) -> Vec<Record> {
        let candidates = self.prepare(entries, options.silent);
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut result = Vec::with_capacity(candidates.len());
        let mut inserted = Vec::new();
        let mut merges = Vec::new();
        {
            let mut state = self.write();
            let mut at = options.at;
            for candidate in candidates {
                let existing = if options.force {
                    None
                } else {
                    state
                        .position_of_key(&candidate.record.key())
                        .and_then(|i| state.record_at(i).cloned())
                };
                if let Some(existing) = existing {
                    if options.merge && !existing.ptr_eq(&candidate.record) {
                        merges.push((existing.clone(), candidate.attributes()));
                    }
                    state.touch(existing.client_id());
                    result.push(existing);
                    continue;
                }

                for evicted in state.make_room(1) {
                    self.release(&mut state, &evicted);
                }
                let index = match at {
                    Some(i) => {
                        at = Some(i + 1);
                        i
                    }
                    None => state.slots.len(),
                };
                let record = candidate.record;
                let attached = self.adopt(&mut state, &record);
                state.insert_at(index, record.clone(), attached);
                state.adjust_total(true);
                inserted.push(record.clone());
                result.push(record);
            }
        }

        let comparator = self.comparator();
        let mut needs_sort = !inserted.is_empty();
        let mut merged = Vec::new();
        for (record, attrs) in merges {
            let options = SetOptions {
                silent: options.silent,
                ..SetOptions::default()
            };
            if record.set_attributes(attrs, options) && record.has_changed(None) {
                let changed = record.changed();
                let keys: Vec<&String> = changed.keys().collect();
                if comparator.as_ref().is_some_and(|c| c.is_affected_by(&keys)) {
                    needs_sort = true;
                }
                merged.push(record);
            }
        }

        let sort_now = needs_sort && options.sort && options.at.is_none();
        let events = {
            let mut state = self.write();
            let sorted =
                sort_now && !state.is_virtual() && state.resident.len() > 1 && state.sort_resident();
            let mut events = Vec::new();
            if !options.silent {
                let mut batch = Vec::new();
                for record in inserted.iter().chain(merged.iter()) {
                    if let Some(index) = state.position_of(record.client_id()) {
                        events.push(StoreEvent::Add {
                            record: record.clone(),
                            index,
                        });
                        batch.push(record.clone());
                    }
                }
                if !batch.is_empty() {
                    events.push(StoreEvent::AllAdded { records: batch });
                }
                if sorted {
                    events.push(StoreEvent::Sort);
                }
            }
            events
        };
        self.emit(events);
        result
    }

    /// Remove records by id, client id or handle. Fails on a virtualized
    /// store; use `remove_async`.
    pub fn remove<I>(&self, keys: I, options: RemoveOptions) -> Result<Vec<Record>>
    where
        I: IntoIterator,
        I::Item: Into<RecordKey>,
    {
        self.ensure_local("remove")?;
        Ok(self.remove_internal(keys.into_iter().map(Into::into).collect(), options))
    }

    pub(crate) fn remove_internal(&self, keys: Vec<RecordKey>, options: RemoveOptions) -> Vec<Record> {
        let removed: Vec<(Record, usize)> = {
            let mut state = self.write();
            let mut removed = Vec::new();
            for key in keys {
                let Some(index) = state.position_of_key(&key) else {
                    continue;
                };
                if let Some(record) = state.remove_at(index) {
                    state.adjust_total(false);
                    self.release(&mut state, &record);
                    removed.push((record, index));
                }
            }
            removed
        };

        if !options.silent && !removed.is_empty() {
            let mut events: Vec<StoreEvent> = removed
                .iter()
                .map(|(record, index)| StoreEvent::Remove {
                    record: record.clone(),
                    index: *index,
                })
                .collect();
            events.push(StoreEvent::AllRemoved {
                records: removed.iter().map(|(r, _)| r.clone()).collect(),
            });
            self.emit(events);
        }
        removed.into_iter().map(|(r, _)| r).collect()
    }

    /// Replace the contents. An empty input clears the store. Fails on a
    /// virtualized store; use `reset_async`.
    pub fn reset<I>(&self, entries: I, silent: bool) -> Result<Vec<Record>>
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        self.ensure_local("reset")?;
        Ok(self.reset_internal(entries.into_iter().map(Into::into).collect(), silent))
    }

    pub(crate) fn reset_internal(&self, entries: Vec<Entry>, silent: bool) -> Vec<Record> {
        let previous = {
            let mut state = self.write();
            let previous = state.clear(0);
            for record in &previous {
                self.release(&mut state, record);
            }
            state.paging = PagingState::default();
            previous
        };
        let records = self.add_internal(
            entries,
            AddOptions {
                silent: true,
                ..AddOptions::default()
            },
        );
        if !silent {
            self.inner.events.trigger(&StoreEvent::Reset { previous });
        }
        records
    }

    /// Re-sort resident records. Fails on a virtualized store, where
    /// sorting is delegated to the server; use `sort_async`.
    pub fn sort(&self, options: SortOptions) -> Result<()> {
        self.ensure_local("sort")?;
        let sorted = self.write().sort_resident();
        if !sorted {
            return Err(Error::UnsupportedComparator(
                "store has no comparator".to_string(),
            ));
        }
        if !options.silent {
            self.inner.events.trigger(&StoreEvent::Sort);
        }
        Ok(())
    }

    /// Drop every resident record of a virtualized store, keeping holes
    /// sized to the known total, and emit `sort`.
    pub(crate) fn clear_for_sort(&self, silent: bool) -> Result<()> {
        {
            let mut state = self.write();
            if let Some(comparator) = &state.comparator {
                if comparator.server_sort().is_none() {
                    return Err(Error::UnsupportedComparator(format!(
                        "{:?} cannot be applied by the server",
                        comparator
                    )));
                }
            }
            let len = state.paging.total_results.unwrap_or(0);
            let dropped = state.clear(len);
            for record in &dropped {
                self.release(&mut state, record);
            }
            tracing::debug!(dropped = dropped.len(), "virtualized sort cleared local data");
        }
        if !silent {
            self.inner.events.trigger(&StoreEvent::Sort);
        }
        Ok(())
    }
}

impl Observable for Store {
    type Event = StoreEvent;

    fn emitter(&self) -> &EventEmitter<StoreEvent> {
        &self.inner.events
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("len", &state.slots.len())
            .field("resident", &state.resident.len())
            .field("fetch_size", &state.fetch_size)
            .field("model_limit", &state.model_limit)
            .finish()
    }
}
