//! Set reconciliation: bring a store in line with an incoming list.
//!
//! # Algorithm
//!
//! 1. Claim the existing record for every incoming entry that has one,
//!    queueing an attribute merge when enabled
//! 2. Append entries without a counterpart (when adding)
//! 3. Remove every unclaimed resident record (when removing)
//! 4. Without a comparator, when both adding and removing, rearrange
//!    positions to match the incoming order and emit a single `sort`
//! 5. With a comparator, re-sort if anything was added or a merge touched
//!    a sort attribute

use crate::{
    error::Result,
    record::{ClientId, SetOptions},
    store::{Entry, StoreEvent, StoreState},
    Record, Store,
};
use std::collections::HashSet;

/// Options for [`Store::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub add: bool,
    pub remove: bool,
    pub merge: bool,
    pub silent: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            add: true,
            remove: true,
            merge: true,
            silent: false,
        }
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Incoming entries resolved to records, in incoming order
    pub records: Vec<Record>,
    pub added: Vec<Record>,
    /// Existing records whose attributes changed
    pub merged: Vec<Record>,
    pub removed: Vec<Record>,
    /// Whether positions were rearranged or re-sorted
    pub reordered: bool,
}

impl StoreState {
    /// Rewrite resident positions to follow `order`. Only applies when the
    /// resident records are exactly `order`.
    fn align_order(&mut self, order: &[Record]) -> bool {
        let positions: Vec<usize> = self.resident.iter().copied().collect();
        if positions.len() != order.len() {
            return false;
        }
        let mut moved = false;
        for (index, record) in positions.into_iter().zip(order) {
            if !self.record_at(index).is_some_and(|r| r.ptr_eq(record)) {
                self.slots[index] = Some(record.clone());
                moved = true;
            }
        }
        moved
    }
}

impl Store {
    /// Reconcile the store against `entries`. Fails on a virtualized store;
    /// use `set_async`.
    pub fn set<I>(&self, entries: I, options: ReconcileOptions) -> Result<Reconciliation>
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        self.ensure_local("set")?;
        Ok(self.set_internal(entries.into_iter().map(Into::into).collect(), options))
    }

    pub(crate) fn set_internal(&self, entries: Vec<Entry>, options: ReconcileOptions) -> Reconciliation {
        let candidates = self.prepare(entries, options.silent);
        let mut outcome = Reconciliation::default();
        let mut merges = Vec::new();
        let mut removed_at = Vec::new();
        let mut aligned = false;
        {
            let mut state = self.write();
            let mut claimed: HashSet<ClientId> = HashSet::new();

            for candidate in candidates {
                let existing = state
                    .position_of_key(&candidate.record.key())
                    .and_then(|i| state.record_at(i).cloned());
                match existing {
                    Some(existing) => {
                        if options.merge && !existing.ptr_eq(&candidate.record) {
                            merges.push((existing.clone(), candidate.attributes()));
                        }
                        state.touch(existing.client_id());
                        if claimed.insert(existing.client_id()) {
                            outcome.records.push(existing);
                        }
                    }
                    None if options.add => {
                        for evicted in state.make_room(1) {
                            self.release(&mut state, &evicted);
                        }
                        let record = candidate.record;
                        let attached = self.adopt(&mut state, &record);
                        let end = state.slots.len();
                        state.insert_at(end, record.clone(), attached);
                        state.adjust_total(true);
                        claimed.insert(record.client_id());
                        outcome.added.push(record.clone());
                        outcome.records.push(record);
                    }
                    None => {}
                }
            }

            if options.remove {
                let stale: Vec<ClientId> = state
                    .resident_records()
                    .iter()
                    .map(Record::client_id)
                    .filter(|cid| !claimed.contains(cid))
                    .collect();
                for client_id in stale {
                    let Some(index) = state.position_of(client_id) else {
                        continue;
                    };
                    if let Some(record) = state.remove_at(index) {
                        state.adjust_total(false);
                        self.release(&mut state, &record);
                        removed_at.push((record, index));
                    }
                }
            }

            if state.comparator.is_none() && options.add && options.remove {
                aligned = state.align_order(&outcome.records);
            }
        }

        let comparator = self.comparator();
        let mut needs_sort = !outcome.added.is_empty();
        for (record, attrs) in merges {
            let set_options = SetOptions {
                silent: options.silent,
                ..SetOptions::default()
            };
            if record.set_attributes(attrs, set_options) && record.has_changed(None) {
                let changed = record.changed();
                let keys: Vec<&String> = changed.keys().collect();
                if comparator.as_ref().is_some_and(|c| c.is_affected_by(&keys)) {
                    needs_sort = true;
                }
                outcome.merged.push(record);
            }
        }

        let events = {
            let mut state = self.write();
            let sorted = needs_sort
                && !state.is_virtual()
                && state.resident.len() > 1
                && state.sort_resident();
            outcome.reordered = aligned || sorted;

            let mut events = Vec::new();
            if !options.silent {
                for (record, index) in &removed_at {
                    events.push(StoreEvent::Remove {
                        record: record.clone(),
                        index: *index,
                    });
                }
                if !removed_at.is_empty() {
                    events.push(StoreEvent::AllRemoved {
                        records: removed_at.iter().map(|(r, _)| r.clone()).collect(),
                    });
                }
                let mut batch = Vec::new();
                for record in &outcome.added {
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
                if outcome.reordered {
                    events.push(StoreEvent::Sort);
                }
            }
            events
        };

        tracing::debug!(
            added = outcome.added.len(),
            merged = outcome.merged.len(),
            removed = removed_at.len(),
            reordered = outcome.reordered,
            "store reconciled"
        );
        outcome.removed = removed_at.into_iter().map(|(r, _)| r).collect();
        self.emit(events);
        outcome
    }
}
