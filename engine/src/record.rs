//! Record: a single addressable unit of data.
//!
//! A [`Record`] is a cheap-to-clone handle. Clones share the same attribute
//! storage, change tracking and listeners, so a record held by application
//! code and the same record resident in a [`Store`](crate::Store) observe
//! each other's mutations.
//!
//! Records carry no pointers into stores. Ownership by a store is recorded
//! as an opaque owner id plus the sync context (URL, adapter) the owning
//! store lends to the record.

use crate::{
    config::RecordConfig,
    error::Result,
    events::{Event, EventEmitter, Observable},
    query::Criteria,
    sync::{RequestSet, SyncAdapter, SyncError, SyncMethod},
    value::{deep_equal_opt, display_value},
    Attributes, Error,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a record as known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive an identity from an attribute value.
    ///
    /// Strings, numbers and booleans map to their textual form; arrays of
    /// those map to a comma-joined composite. Null and objects carry no
    /// identity.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null | Value::Object(_) => None,
            Value::Array(parts) => {
                let parts = parts
                    .iter()
                    .map(|p| match p {
                        Value::Null | Value::Array(_) | Value::Object(_) => None,
                        scalar => Some(display_value(scalar)),
                    })
                    .collect::<Option<Vec<_>>>()?;
                Some(Self(parts.join(",")))
            }
            scalar => Some(Self(display_value(scalar))),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<i32> for RecordId {
    fn from(id: i32) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Immutable identity assigned to every record at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Locates a record by id first, then by client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RecordKey {
    pub id: Option<RecordId>,
    pub client_id: Option<ClientId>,
}

impl RecordKey {
    /// Whether `record` is the one this key designates.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(id) = &self.id {
            if record.id().as_ref() == Some(id) {
                return true;
            }
        }
        self.client_id == Some(record.client_id())
    }
}

impl From<&Record> for RecordKey {
    fn from(record: &Record) -> Self {
        record.key()
    }
}

impl From<Record> for RecordKey {
    fn from(record: Record) -> Self {
        record.key()
    }
}

impl From<RecordId> for RecordKey {
    fn from(id: RecordId) -> Self {
        Self {
            id: Some(id),
            client_id: None,
        }
    }
}

impl From<ClientId> for RecordKey {
    fn from(client_id: ClientId) -> Self {
        Self {
            id: None,
            client_id: Some(client_id),
        }
    }
}

impl From<&str> for RecordKey {
    fn from(id: &str) -> Self {
        RecordId::from(id).into()
    }
}

impl From<i32> for RecordKey {
    fn from(id: i32) -> Self {
        RecordId::from(id).into()
    }
}

impl From<i64> for RecordKey {
    fn from(id: i64) -> Self {
        RecordId::from(id).into()
    }
}

/// Options for attribute mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
    /// Mutate and track changes without emitting events
    pub silent: bool,
    /// Remove the given attributes instead of setting them
    pub unset: bool,
    /// Run the configured validator before mutating
    pub validate: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            silent: false,
            unset: false,
            validate: true,
        }
    }
}

impl SetOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

/// Events emitted by a record.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    /// One or more attributes changed; `changes` maps each to its new value
    /// (`null` for removed attributes).
    Change { record: Record, changes: Attributes },
    /// A single attribute changed. Delivered as `change:<attribute>`.
    AttributeChange {
        record: Record,
        attribute: String,
        value: Option<Value>,
    },
    /// Validation rejected a mutation.
    Invalid { record: Record, error: Value },
    Request { record: Record, method: SyncMethod },
    Sync {
        record: Record,
        method: SyncMethod,
        response: Value,
    },
    Error {
        record: Record,
        method: SyncMethod,
        error: SyncError,
    },
    Destroy { record: Record },
}

impl RecordEvent {
    pub fn record(&self) -> &Record {
        match self {
            RecordEvent::Change { record, .. }
            | RecordEvent::AttributeChange { record, .. }
            | RecordEvent::Invalid { record, .. }
            | RecordEvent::Request { record, .. }
            | RecordEvent::Sync { record, .. }
            | RecordEvent::Error { record, .. }
            | RecordEvent::Destroy { record } => record,
        }
    }
}

impl Event for RecordEvent {
    fn name(&self) -> Cow<'_, str> {
        match self {
            RecordEvent::Change { .. } => Cow::Borrowed("change"),
            RecordEvent::AttributeChange { attribute, .. } => {
                Cow::Owned(format!("change:{}", attribute))
            }
            RecordEvent::Invalid { .. } => Cow::Borrowed("invalid"),
            RecordEvent::Request { .. } => Cow::Borrowed("request"),
            RecordEvent::Sync { .. } => Cow::Borrowed("sync"),
            RecordEvent::Error { .. } => Cow::Borrowed("error"),
            RecordEvent::Destroy { .. } => Cow::Borrowed("destroy"),
        }
    }
}

/// Sync context a store lends to the records it owns.
#[derive(Clone)]
pub(crate) struct StoreLink {
    pub(crate) store_id: u64,
    pub(crate) url: Option<String>,
    pub(crate) adapter: Option<Arc<dyn SyncAdapter>>,
    /// The store's outstanding requests, which this record's join
    pub(crate) requests: Arc<RequestSet>,
}

#[derive(Debug, Clone, Default)]
struct RecordState {
    attributes: Attributes,
    id: Option<RecordId>,
    changed: Attributes,
    previous: Attributes,
    validation_error: Option<Value>,
}

struct RecordInner {
    client_id: ClientId,
    config: Arc<RecordConfig>,
    state: RwLock<RecordState>,
    events: EventEmitter<RecordEvent>,
    link: Mutex<Option<StoreLink>>,
}

/// A single addressable data unit.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

fn to_attributes(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

impl Record {
    /// Create a record with the default configuration.
    ///
    /// Non-object values yield a record without attributes.
    pub fn new(attributes: Value) -> Self {
        Self::with_config(Arc::new(RecordConfig::default()), attributes)
    }

    /// Create a record using `config` for identity, defaults and validation.
    pub fn with_config(config: Arc<RecordConfig>, attributes: Value) -> Self {
        let mut attrs = config.defaults.clone();
        attrs.extend(to_attributes(attributes));
        let id = config.compute_id(&attrs);
        Self {
            inner: Arc::new(RecordInner {
                client_id: ClientId::next(),
                config,
                state: RwLock::new(RecordState {
                    attributes: attrs,
                    id,
                    ..Default::default()
                }),
                events: EventEmitter::new(),
                link: Mutex::new(None),
            }),
        }
    }

    /// Identity derived from the identity attribute(s), if set.
    pub fn id(&self) -> Option<RecordId> {
        self.inner.state.read().id.clone()
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    /// Key locating this record by id, falling back to client id.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            id: self.id(),
            client_id: Some(self.client_id()),
        }
    }

    pub fn config(&self) -> &Arc<RecordConfig> {
        &self.inner.config
    }

    /// Whether two handles refer to the same record.
    pub fn ptr_eq(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn get(&self, attribute: &str) -> Option<Value> {
        self.inner.state.read().attributes.get(attribute).cloned()
    }

    /// Whether `attribute` holds a non-null value.
    pub fn has(&self, attribute: &str) -> bool {
        self.inner
            .state
            .read()
            .attributes
            .get(attribute)
            .is_some_and(|v| !v.is_null())
    }

    /// Copy of all attributes.
    pub fn attributes(&self) -> Attributes {
        self.inner.state.read().attributes.clone()
    }

    /// Borrow the attributes for the duration of `f`.
    pub fn with_attributes<R>(&self, f: impl FnOnce(&Attributes) -> R) -> R {
        f(&self.inner.state.read().attributes)
    }

    /// Set one attribute. Returns `false` if validation rejected it.
    pub fn set(&self, attribute: impl Into<String>, value: Value) -> bool {
        let mut attrs = Attributes::new();
        attrs.insert(attribute.into(), value);
        self.set_attributes(attrs, SetOptions::default())
    }

    /// Merge several attributes. Returns `false` if validation rejected them,
    /// in which case nothing was mutated.
    pub fn set_attributes(&self, attributes: Attributes, options: SetOptions) -> bool {
        let changes = attributes
            .into_iter()
            .map(|(k, v)| if options.unset { (k, None) } else { (k, Some(v)) })
            .collect();
        self.apply(changes, options, true)
    }

    /// Remove one attribute.
    pub fn unset(&self, attribute: &str, options: SetOptions) -> bool {
        self.apply(vec![(attribute.to_string(), None)], options, true)
    }

    /// Remove every attribute. Emits a single `change` event.
    pub fn clear(&self, options: SetOptions) -> bool {
        let keys: Vec<String> = self.inner.state.read().attributes.keys().cloned().collect();
        let changes = keys.into_iter().map(|k| (k, None)).collect();
        self.apply(changes, options, false)
    }

    fn apply(
        &self,
        changes: Vec<(String, Option<Value>)>,
        options: SetOptions,
        per_attribute_events: bool,
    ) -> bool {
        let config = &self.inner.config;
        if options.validate {
            if let Some(validator) = &config.validator {
                let mut candidate = self.attributes();
                for (k, v) in &changes {
                    match v {
                        Some(v) => candidate.insert(k.clone(), v.clone()),
                        None => candidate.remove(k),
                    };
                }
                if let Err(error) = validator.validate(&candidate) {
                    self.inner.state.write().validation_error = Some(error.clone());
                    if !options.silent {
                        self.inner.events.trigger(&RecordEvent::Invalid {
                            record: self.clone(),
                            error,
                        });
                    }
                    return false;
                }
            }
        }

        let (applied, changed) = {
            let mut state = self.inner.state.write();
            state.previous = state.attributes.clone();
            state.changed = Attributes::new();
            state.validation_error = None;
            let mut applied = Vec::new();
            for (key, value) in changes {
                match value {
                    None => {
                        if state.attributes.remove(&key).is_some() {
                            state.changed.insert(key.clone(), Value::Null);
                            applied.push((key, None));
                        }
                    }
                    Some(value) => {
                        if !deep_equal_opt(state.attributes.get(&key), Some(&value)) {
                            state.attributes.insert(key.clone(), value.clone());
                            state.changed.insert(key.clone(), value.clone());
                            applied.push((key, Some(value)));
                        }
                    }
                }
            }
            state.id = config.compute_id(&state.attributes);
            (applied, state.changed.clone())
        };

        if !options.silent && !applied.is_empty() {
            if per_attribute_events {
                for (attribute, value) in applied {
                    self.inner.events.trigger(&RecordEvent::AttributeChange {
                        record: self.clone(),
                        attribute,
                        value,
                    });
                }
            }
            self.inner.events.trigger(&RecordEvent::Change {
                record: self.clone(),
                changes: changed,
            });
        }
        true
    }

    /// Attributes changed by the most recent mutation.
    pub fn changed(&self) -> Attributes {
        self.inner.state.read().changed.clone()
    }

    /// Whether the most recent mutation changed anything, or `attribute`
    /// specifically. A record with changes is considered to hold unsaved
    /// local edits.
    pub fn has_changed(&self, attribute: Option<&str>) -> bool {
        let state = self.inner.state.read();
        match attribute {
            Some(attr) => state.changed.contains_key(attr),
            None => !state.changed.is_empty(),
        }
    }

    /// Without `diff`, the attributes changed by the last mutation. With
    /// `diff`, the entries of `diff` that differ from the current values.
    /// `None` when nothing differs.
    pub fn changed_attributes(&self, diff: Option<&Attributes>) -> Option<Attributes> {
        let state = self.inner.state.read();
        let result = match diff {
            None => state.changed.clone(),
            Some(diff) => diff
                .iter()
                .filter(|(k, v)| !deep_equal_opt(state.attributes.get(*k), Some(v)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        (!result.is_empty()).then_some(result)
    }

    /// Value of `attribute` before the most recent mutation.
    pub fn previous(&self, attribute: &str) -> Option<Value> {
        self.inner.state.read().previous.get(attribute).cloned()
    }

    /// Snapshot of all attributes before the most recent mutation.
    pub fn previous_attributes(&self) -> Attributes {
        self.inner.state.read().previous.clone()
    }

    /// Forget change tracking, as after a successful server round-trip.
    pub(crate) fn mark_clean(&self) {
        let mut state = self.inner.state.write();
        state.changed = Attributes::new();
        state.previous = state.attributes.clone();
    }

    /// A record is new until it has an identity.
    pub fn is_new(&self) -> bool {
        self.inner.state.read().id.is_none()
    }

    /// Run the validator against the current attributes.
    pub fn is_valid(&self) -> bool {
        let Some(validator) = &self.inner.config.validator else {
            return true;
        };
        let result = validator.validate(&self.attributes());
        let mut state = self.inner.state.write();
        match result {
            Ok(()) => {
                state.validation_error = None;
                true
            }
            Err(error) => {
                state.validation_error = Some(error);
                false
            }
        }
    }

    /// Payload returned by the last failed validation.
    pub fn validation_error(&self) -> Option<Value> {
        self.inner.state.read().validation_error.clone()
    }

    /// Whether every attribute in `attrs` is present with a structurally
    /// equal value.
    pub fn matches(&self, attrs: &Attributes) -> bool {
        let state = self.inner.state.read();
        attrs
            .iter()
            .all(|(k, v)| deep_equal_opt(state.attributes.get(k), Some(v)))
    }

    /// Evaluate multi-clause criteria locally.
    pub fn contains(&self, criteria: &Criteria) -> Result<bool> {
        criteria.matches(self)
    }

    /// Copy with a fresh client id and deep-copied attributes. The copy
    /// belongs to no store.
    pub fn duplicate(&self) -> Record {
        let state = self.inner.state.read().clone();
        Self {
            inner: Arc::new(RecordInner {
                client_id: ClientId::next(),
                config: Arc::clone(&self.inner.config),
                state: RwLock::new(state),
                events: EventEmitter::new(),
                link: Mutex::new(None),
            }),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.state.read().attributes.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner.state.read().attributes.values().cloned().collect()
    }

    pub fn pairs(&self) -> Vec<(String, Value)> {
        self.inner
            .state
            .read()
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Subset of attributes limited to `keys`.
    pub fn pick(&self, keys: &[&str]) -> Attributes {
        let state = self.inner.state.read();
        keys.iter()
            .filter_map(|k| state.attributes.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }

    /// Attributes except `keys`.
    pub fn omit(&self, keys: &[&str]) -> Attributes {
        let state = self.inner.state.read();
        state
            .attributes
            .iter()
            .filter(|(k, _)| !keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.attributes())
    }

    /// Resource URL: the owning store's URL (or the configured URL root)
    /// followed by the id. New records resolve to the collection URL.
    pub fn url(&self) -> Result<String> {
        let base = self
            .inner
            .link
            .lock()
            .as_ref()
            .and_then(|l| l.url.clone())
            .or_else(|| self.inner.config.url_root.clone())
            .ok_or_else(|| Error::MissingUrl(format!("record {}", self.client_id())))?;
        Ok(match self.id() {
            Some(id) => format!("{}/{}", base.trim_end_matches('/'), id),
            None => base,
        })
    }

    pub(crate) fn adapter(&self) -> Option<Arc<dyn SyncAdapter>> {
        self.inner
            .link
            .lock()
            .as_ref()
            .and_then(|l| l.adapter.clone())
            .or_else(|| self.inner.config.adapter.clone())
    }

    pub(crate) fn store_requests(&self) -> Option<Arc<RequestSet>> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|l| Arc::clone(&l.requests))
    }

    /// Id of the owning store, if any.
    pub fn owner(&self) -> Option<u64> {
        self.inner.link.lock().as_ref().map(|l| l.store_id)
    }

    /// Claim ownership for a store. A record already owned elsewhere keeps
    /// its owner; returns whether the claim took effect.
    pub(crate) fn attach(&self, link: StoreLink) -> bool {
        let mut current = self.inner.link.lock();
        match current.as_ref() {
            Some(existing) if existing.store_id != link.store_id => false,
            _ => {
                *current = Some(link);
                true
            }
        }
    }

    /// Release ownership if held by `store_id`.
    pub(crate) fn detach(&self, store_id: u64) {
        let mut current = self.inner.link.lock();
        if current.as_ref().is_some_and(|l| l.store_id == store_id) {
            *current = None;
        }
    }
}

impl Observable for Record {
    type Event = RecordEvent;

    fn emitter(&self) -> &EventEmitter<RecordEvent> {
        &self.inner.events
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Record")
            .field("client_id", &self.inner.client_id)
            .field("id", &state.id)
            .field("attributes", &state.attributes)
            .finish()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Record {}
