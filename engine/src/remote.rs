//! Remote and sequenced store operations.
//!
//! Every public method here enqueues its work on the store's sequencer at
//! call time and returns a `'static` future for the result, so operations
//! issued back to back run strictly one after another even when nobody
//! awaits the earlier ones. Jobs call the `*_inner` functions directly and
//! never enqueue further work.
//!
//! Reads against a virtualized store fill slots at the offset the server
//! reports, pre-sizing the store to the server's total when it is known.

use crate::{
    error::Result,
    paging::{Page, PagingState},
    query::Query,
    reconcile::{ReconcileOptions, Reconciliation},
    record::{RecordKey, SetOptions},
    record_sync::SaveOptions,
    store::{AddOptions, Entry, LocalRange, RemoveOptions, SortOptions, StoreEvent},
    sync::{FetchParams, SyncMethod, SyncRequest, SyncTarget},
    Attributes, Error, Record, Store,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Options for [`Store::fetch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    pub params: FetchParams,
    /// Replace the contents instead of reconciling (non-virtualized only)
    pub reset: bool,
    pub reconcile: ReconcileOptions,
}

impl FetchOptions {
    pub fn reset() -> Self {
        Self {
            reset: true,
            ..Self::default()
        }
    }

    /// Read one page starting at `start_index`.
    pub fn page(start_index: usize, fetch_size: usize) -> Self {
        Self {
            params: FetchParams {
                start_index: Some(start_index),
                fetch_size: Some(fetch_size),
                ..FetchParams::default()
            },
            ..Self::default()
        }
    }
}

impl Store {
    fn record_from(&self, value: Value) -> Record {
        Record::with_config(Arc::clone(&self.inner.config.record), value)
    }

    /// Fill in sort and paging parameters from the store's state.
    fn decorate(&self, mut params: FetchParams) -> FetchParams {
        let state = self.inner.state.read();
        if params.sort.is_none() {
            params.sort = state
                .comparator
                .as_ref()
                .and_then(|c| c.server_sort())
                .map(str::to_string);
        }
        if params.sort.is_some() && params.sort_dir.is_none() {
            params.sort_dir = Some(state.sort_direction);
        }
        if !state.is_virtual() {
            params.all = true;
        } else if params.fetch_size.is_none() && !params.all {
            params.fetch_size = state.fetch_size;
        }
        params
    }

    fn parse_page(&self, response: Value) -> Result<Page> {
        let response = match &self.inner.config.parse {
            Some(parse) => parse(response),
            None => response,
        };
        Page::parse(response, self.inner.config.paging.as_ref())
    }

    /// Issue one request through the adapter, tracked for [`Store::abort`].
    pub(crate) async fn request(
        &self,
        method: SyncMethod,
        params: FetchParams,
        payload: Option<Value>,
    ) -> Result<Value> {
        let url = self
            .inner
            .config
            .resolve_url(method, &params)
            .ok_or_else(|| Error::MissingUrl(format!("store {}", self.id())))?;
        let adapter = self.adapter().ok_or(Error::MissingAdapter)?;

        self.inner.events.trigger(&StoreEvent::Request {
            method,
            params: params.clone(),
        });
        tracing::debug!(
            %method,
            %url,
            start = ?params.start_index,
            size = ?params.fetch_size,
            "store request"
        );

        let request = SyncRequest {
            method,
            url,
            target: SyncTarget::Store(self.clone()),
            payload,
            params: params.clone(),
        };
        let error = match self.inner.requests.track(adapter.sync(request)).await {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };
        tracing::warn!(%method, %error, "store request failed");
        self.inner.events.trigger(&StoreEvent::Error {
            method,
            params,
            error: error.clone(),
        });
        if error.is_aborted() {
            Err(Error::Aborted)
        } else {
            Err(Error::Sync(error))
        }
    }

    /// Read one page. With `place`, records land at the offset the response
    /// reports (or the requested start index); otherwise, or when neither
    /// is known, they are returned without joining the store.
    pub(crate) async fn fetch_page(&self, params: FetchParams, place: bool) -> Result<Vec<Record>> {
        let params = self.decorate(params);
        let response = self.request(SyncMethod::Read, params.clone(), None).await?;
        let page = self.parse_page(response.clone())?;
        let items: Vec<Value> = page
            .items
            .into_iter()
            .map(|v| self.inner.config.record.parse(v))
            .collect();

        let positioned = place && (page.info.offset.is_some() || params.start_index.is_some());
        if !positioned {
            let records = items.into_iter().map(|v| self.record_from(v)).collect();
            self.inner.events.trigger(&StoreEvent::Sync {
                method: SyncMethod::Read,
                response,
            });
            return Ok(records);
        }

        let count = items.len();
        let mut records = Vec::with_capacity(count);
        let mut placed = Vec::new();
        let mut merges = Vec::new();
        {
            let mut state = self.write();
            state.paging.update(&page.info, &params, count);
            let offset = state.paging.offset;
            let len = match state.paging.total_results {
                Some(total) => total.max(offset + count),
                None => state.slots.len().max(offset + count),
            };
            for cut in state.resize(len) {
                self.release(&mut state, &cut);
            }

            for (i, item) in items.into_iter().enumerate() {
                let index = offset + i;
                let incoming = self.record_from(item.clone());
                let id = incoming.id();

                if let Some(existing) = state.record_at(index).cloned() {
                    if id.is_some() && existing.id() == id {
                        state.touch(existing.client_id());
                        merges.push((existing.clone(), item.as_object().cloned().unwrap_or_default()));
                        records.push(existing);
                        continue;
                    }
                }
                if let Some(id) = &id {
                    if let Some(other) = state
                        .position_of_key(&RecordKey::from(id.clone()))
                        .filter(|p| *p != index)
                    {
                        tracing::warn!(%id, index, other, "duplicate record id in virtualized data");
                    }
                }

                for evicted in state.make_room(1) {
                    self.release(&mut state, &evicted);
                }
                let attached = self.adopt(&mut state, &incoming);
                if let Some(displaced) = state.place_at(index, incoming.clone(), attached) {
                    self.release(&mut state, &displaced);
                }
                placed.push((incoming.clone(), index));
                records.push(incoming);
            }
            tracing::debug!(
                offset,
                count,
                total = ?state.paging.total_results,
                has_more = state.paging.has_more,
                resident = state.resident.len(),
                "page filled"
            );
        }

        for (record, attrs) in merges {
            let options = SetOptions {
                validate: false,
                ..SetOptions::default()
            };
            record.set_attributes(attrs, options);
            record.mark_clean();
        }

        let mut events: Vec<StoreEvent> = placed
            .iter()
            .map(|(record, index)| StoreEvent::Add {
                record: record.clone(),
                index: *index,
            })
            .collect();
        if !placed.is_empty() {
            events.push(StoreEvent::AllAdded {
                records: placed.into_iter().map(|(r, _)| r).collect(),
            });
        }
        events.push(StoreEvent::Sync {
            method: SyncMethod::Read,
            response,
        });
        self.emit(events);
        Ok(records)
    }

    pub(crate) async fn fetch_inner(&self, options: FetchOptions) -> Result<Vec<Record>> {
        if self.is_virtual() {
            let mut params = options.params;
            if params.start_index.is_none() && params.start_id.is_none() {
                params.start_index = Some(0);
            }
            return self.fetch_page(params, true).await;
        }

        let params = self.decorate(options.params);
        let response = self.request(SyncMethod::Read, params.clone(), None).await?;
        let page = self.parse_page(response.clone())?;
        let entries: Vec<Entry> = page
            .items
            .into_iter()
            .map(|v| Entry::Raw(self.inner.config.record.parse(v)))
            .collect();
        let count = entries.len();

        let records = if options.reset {
            self.reset_internal(entries, false)
        } else {
            self.set_internal(entries, options.reconcile).records
        };
        for record in &records {
            record.mark_clean();
        }
        self.write().paging.update(&page.info, &params, count);
        self.inner.events.trigger(&StoreEvent::Sync {
            method: SyncMethod::Read,
            response,
        });
        Ok(records)
    }

    /// Make `start..start + count` resident, fetching what is missing.
    ///
    /// Resolves with the resident run from `start`, which is shorter than
    /// `count` only when the data ends first.
    pub(crate) async fn set_range_local_inner(&self, start: usize, count: usize) -> Result<LocalRange> {
        let virtual_store = {
            let mut state = self.write();
            state.cursor = start;
            if state.is_virtual() && state.model_limit.is_some_and(|limit| limit < count) {
                tracing::debug!(count, "raising model limit to hold the requested range");
                state.model_limit = Some(count);
            }
            state.is_virtual()
        };
        if !virtual_store {
            return Ok(self.local_range(start, count));
        }

        let mut last_missing = None;
        loop {
            let (local, past_end, fetch_size) = {
                let mut state = self.write();
                let local = state.local_range(start, count);
                // keep the resident prefix from being evicted by the fill
                for record in &local {
                    state.touch(record.client_id());
                }
                let past_end = state.paging.is_past_end(start + local.len());
                (local, past_end, state.fetch_size.unwrap_or(count))
            };
            let missing = start + local.len();
            if local.len() >= count || past_end || last_missing == Some(missing) {
                return Ok(LocalRange {
                    start,
                    records: local,
                });
            }
            last_missing = Some(missing);

            let params = FetchParams {
                start_index: Some(missing),
                fetch_size: Some(fetch_size.max(count - local.len())),
                ..FetchParams::default()
            };
            let fetched = self.fetch_page(params, true).await?;
            if fetched.is_empty() || !self.has_more() {
                return Ok(self.local_range(start, count));
            }
        }
    }

    async fn refresh_inner(&self) -> Result<Vec<Record>> {
        let params = FetchParams::default();
        if self.inner.config.resolve_url(SyncMethod::Read, &params).is_none() {
            return Ok(Vec::new());
        }
        if !self.is_virtual() {
            return self.fetch_inner(FetchOptions::reset()).await;
        }

        let (start, size, previous) = {
            let mut state = self.write();
            let start = state.cursor;
            let size = state.fetch_size.unwrap_or(0);
            let previous = state.clear(0);
            for record in &previous {
                self.release(&mut state, record);
            }
            state.paging = PagingState::default();
            (start, size, previous)
        };
        self.inner.events.trigger(&StoreEvent::Reset { previous });
        Ok(self.set_range_local_inner(start, size).await?.records)
    }

    fn page_bounds(&self, forward: bool) -> (usize, usize) {
        let state = self.inner.state.read();
        let size = state
            .fetch_size
            .or(state.paging.last_fetch_size)
            .unwrap_or(state.slots.len());
        let start = if forward {
            state.cursor + size
        } else {
            state.cursor.saturating_sub(size)
        };
        (start, size)
    }

    async fn at_inner(&self, index: usize) -> Result<Option<Record>> {
        if let Some(record) = self.at(index) {
            return Ok(Some(record));
        }
        let known_len = if self.is_virtual() {
            self.total_results()
        } else {
            Some(self.len())
        };
        if let Some(len) = known_len.filter(|len| index >= *len) {
            return Err(Error::IndexOutOfRange { index, len });
        }
        if !self.is_virtual() {
            return Ok(None);
        }
        let range = self.set_range_local_inner(index, 1).await?;
        Ok(range.records.into_iter().next())
    }

    async fn get_inner(&self, key: RecordKey) -> Result<Option<Record>> {
        if let Some(record) = self.get(key.clone()) {
            return Ok(Some(record));
        }
        let Some(id) = key.id.filter(|_| self.is_virtual()) else {
            return Ok(None);
        };
        let params = FetchParams {
            start_id: Some(id.clone()),
            ..FetchParams::default()
        };
        let records = self.fetch_page(params, true).await?;
        Ok(records.into_iter().find(|r| r.id().as_ref() == Some(&id)))
    }

    async fn where_inner(&self, query: Query) -> Result<Vec<Record>> {
        if !self.is_virtual() {
            return self.where_local(query);
        }
        let params = FetchParams {
            query: Some(query.to_query_string()?),
            all: true,
            ..FetchParams::default()
        };
        self.fetch_page(params, false).await
    }

    async fn sort_inner(&self, options: SortOptions) -> Result<()> {
        if !self.is_virtual() {
            return self.sort(options);
        }
        self.clear_for_sort(options.silent)?;
        let size = self.fetch_size().unwrap_or(0);
        self.set_range_local_inner(options.start_index, size).await?;
        Ok(())
    }

    async fn create_inner(&self, entry: Entry, options: SaveOptions) -> Result<Record> {
        let record = match entry {
            Entry::Record(record) => record,
            Entry::Raw(value) => self.record_from(value),
        };
        if options.wait {
            record.attach(self.link());
        } else {
            self.add_internal(vec![Entry::Record(record.clone())], AddOptions::default());
        }

        match record.save(Attributes::new(), options).await {
            Ok(_) => {
                if options.wait {
                    self.add_internal(vec![Entry::Record(record.clone())], AddOptions::default());
                }
                Ok(record)
            }
            Err(error) => {
                if options.wait {
                    record.detach(self.id());
                }
                Err(error)
            }
        }
    }

    // ----- sequenced API -----

    /// Read from the server. A virtualized store fills the requested page;
    /// otherwise the response is reconciled into (or replaces) the contents.
    pub fn fetch(&self, options: FetchOptions) -> impl Future<Output = Result<Vec<Record>>> + Send + 'static {
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.fetch_inner(options).await });
        async move { pending.await? }
    }

    /// Discard local data and reload the current range. A store without a
    /// URL resolves immediately with nothing.
    pub fn refresh(&self) -> impl Future<Output = Result<Vec<Record>>> + Send + 'static {
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.refresh_inner().await });
        async move { pending.await? }
    }

    /// Ensure `start..start + count` is resident.
    pub fn set_range_local(
        &self,
        start: usize,
        count: usize,
    ) -> impl Future<Output = Result<LocalRange>> + Send + 'static {
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.set_range_local_inner(start, count).await });
        async move { pending.await? }
    }

    /// Advance the range by one page.
    pub fn next_page(&self) -> impl Future<Output = Result<LocalRange>> + Send + 'static {
        let store = self.clone();
        let pending = self.inner.sequencer.enqueue(move || async move {
            let (start, size) = store.page_bounds(true);
            store.set_range_local_inner(start, size).await
        });
        async move { pending.await? }
    }

    /// Move the range back by one page, stopping at the start.
    pub fn previous_page(&self) -> impl Future<Output = Result<LocalRange>> + Send + 'static {
        let store = self.clone();
        let pending = self.inner.sequencer.enqueue(move || async move {
            let (start, size) = store.page_bounds(false);
            store.set_range_local_inner(start, size).await
        });
        async move { pending.await? }
    }

    /// Record at `index`, fetched if not resident. An index at or past the
    /// known length fails with [`Error::IndexOutOfRange`] without a request.
    pub fn at_async(&self, index: usize) -> impl Future<Output = Result<Option<Record>>> + Send + 'static {
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.at_inner(index).await });
        async move { pending.await? }
    }

    /// Record by key, asking the server by id if not resident.
    pub fn get_async(
        &self,
        key: impl Into<RecordKey>,
    ) -> impl Future<Output = Result<Option<Record>>> + Send + 'static {
        let key = key.into();
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.get_inner(key).await });
        async move { pending.await? }
    }

    /// Matching records: evaluated locally, or by the server when
    /// virtualized. Server matches do not join the store.
    pub fn where_async(
        &self,
        query: impl Into<Query>,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send + 'static {
        let query = query.into();
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.where_inner(query).await });
        async move { pending.await? }
    }

    /// Sequenced [`Store::add`]. On a virtualized store each entry is its
    /// own step.
    pub fn add_async<I>(
        &self,
        entries: I,
        options: AddOptions,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send + 'static
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        let entries: Vec<Entry> = entries.into_iter().map(Into::into).collect();
        let pending: Vec<_> = if self.is_virtual() {
            entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| {
                    let store = self.clone();
                    let options = AddOptions {
                        at: options.at.map(|at| at + i),
                        ..options
                    };
                    self.inner
                        .sequencer
                        .enqueue(move || async move { store.add_internal(vec![entry], options) })
                })
                .collect()
        } else {
            let store = self.clone();
            vec![self
                .inner
                .sequencer
                .enqueue(move || async move { store.add_internal(entries, options) })]
        };
        async move {
            let mut records = Vec::new();
            for step in pending {
                records.extend(step.await?);
            }
            Ok(records)
        }
    }

    /// Sequenced [`Store::remove`].
    pub fn remove_async<I>(
        &self,
        keys: I,
        options: RemoveOptions,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send + 'static
    where
        I: IntoIterator,
        I::Item: Into<RecordKey>,
    {
        let keys: Vec<RecordKey> = keys.into_iter().map(Into::into).collect();
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.remove_internal(keys, options) });
        async move { pending.await }
    }

    /// Sequenced [`Store::reset`].
    pub fn reset_async<I>(&self, entries: I, silent: bool) -> impl Future<Output = Result<Vec<Record>>> + Send + 'static
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        let entries: Vec<Entry> = entries.into_iter().map(Into::into).collect();
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.reset_internal(entries, silent) });
        async move { pending.await }
    }

    /// Sequenced [`Store::set`].
    pub fn set_async<I>(
        &self,
        entries: I,
        options: ReconcileOptions,
    ) -> impl Future<Output = Result<Reconciliation>> + Send + 'static
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        let entries: Vec<Entry> = entries.into_iter().map(Into::into).collect();
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.set_internal(entries, options) });
        async move { pending.await }
    }

    /// Sort locally, or for a virtualized store drop local data, emit
    /// `sort` and refill from `start_index` in the server's new order.
    pub fn sort_async(&self, options: SortOptions) -> impl Future<Output = Result<()>> + Send + 'static {
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.sort_inner(options).await });
        async move { pending.await? }
    }

    /// Build a record, add it and save it. With `wait`, the record joins
    /// the store only once the server accepts it.
    pub fn create(
        &self,
        entry: impl Into<Entry>,
        options: SaveOptions,
    ) -> impl Future<Output = Result<Record>> + Send + 'static {
        let entry = entry.into();
        let store = self.clone();
        let pending = self
            .inner
            .sequencer
            .enqueue(move || async move { store.create_inner(entry, options).await });
        async move { pending.await? }
    }

    /// Cancel every outstanding request, then resolve once the sequencer
    /// has drained. Cancelled requests fail with [`Error::Aborted`].
    pub fn abort(&self) -> impl Future<Output = ()> + Send + 'static {
        let count = self.inner.requests.abort_all();
        if count > 0 {
            tracing::debug!(count, "aborting outstanding requests");
        }
        self.when_ready()
    }
}
