//! Store and record configuration.
//!
//! Plain-data settings ([`StoreSettings`], [`RecordSettings`]) deserialize
//! from JSON. Runtime configuration ([`StoreConfig`], [`RecordConfig`]) adds
//! the behavioural hooks: adapter, validator, parsers and URL resolution.

use crate::{
    comparator::{Comparator, SortDirection},
    paging::PagingInfo,
    sync::{FetchParams, SyncAdapter, SyncMethod},
    Attributes, RecordId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Validates candidate attributes, returning an error payload on rejection.
pub trait Validator: Send + Sync {
    fn validate(&self, attributes: &Attributes) -> Result<(), Value>;
}

impl<F> Validator for F
where
    F: Fn(&Attributes) -> Result<(), Value> + Send + Sync,
{
    fn validate(&self, attributes: &Attributes) -> Result<(), Value> {
        self(attributes)
    }
}

pub type IdFn = Arc<dyn Fn(&Attributes) -> Option<RecordId> + Send + Sync>;
pub type ParseFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type CustomUrlFn = Arc<dyn Fn(SyncMethod, &FetchParams) -> Option<String> + Send + Sync>;
pub type PagingFn = Arc<dyn Fn(&Value) -> PagingInfo + Send + Sync>;

/// Attribute(s) holding a record's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdAttribute {
    Single(String),
    Composite(Vec<String>),
}

impl Default for IdAttribute {
    fn default() -> Self {
        IdAttribute::Single("id".to_string())
    }
}

/// Serializable record settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordSettings {
    pub id_attribute: IdAttribute,
    pub url_root: Option<String>,
    pub defaults: Attributes,
}

/// Per-kind record configuration shared by every record of that kind.
#[derive(Clone, Default)]
pub struct RecordConfig {
    pub id_attribute: IdAttribute,
    /// Overrides `id_attribute` when set
    pub id_fn: Option<IdFn>,
    pub defaults: Attributes,
    pub url_root: Option<String>,
    pub validator: Option<Arc<dyn Validator>>,
    /// Maps a server payload to attributes
    pub parse: Option<ParseFn>,
    /// Used when the record is not owned by a store
    pub adapter: Option<Arc<dyn SyncAdapter>>,
}

impl RecordConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: RecordSettings) -> Self {
        Self {
            id_attribute: settings.id_attribute,
            url_root: settings.url_root,
            defaults: settings.defaults,
            ..Self::default()
        }
    }

    pub fn with_id_attribute(mut self, id_attribute: IdAttribute) -> Self {
        self.id_attribute = id_attribute;
        self
    }

    pub fn with_id_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Attributes) -> Option<RecordId> + Send + Sync + 'static,
    {
        self.id_fn = Some(Arc::new(f));
        self
    }

    pub fn with_defaults(mut self, defaults: Attributes) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_url_root(mut self, url_root: impl Into<String>) -> Self {
        self.url_root = Some(url_root.into());
        self
    }

    pub fn with_validator<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_parse<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.parse = Some(Arc::new(f));
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SyncAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Identity for `attributes` under this configuration.
    pub fn compute_id(&self, attributes: &Attributes) -> Option<RecordId> {
        if let Some(f) = &self.id_fn {
            return f(attributes);
        }
        match &self.id_attribute {
            IdAttribute::Single(name) => attributes.get(name).and_then(RecordId::from_value),
            IdAttribute::Composite(names) => {
                let parts = names
                    .iter()
                    .map(|n| attributes.get(n).cloned())
                    .collect::<Option<Vec<_>>>()?;
                RecordId::from_value(&Value::Array(parts))
            }
        }
    }

    /// Apply the parse hook to a server payload.
    pub fn parse(&self, payload: Value) -> Value {
        match &self.parse {
            Some(f) => f(payload),
            None => payload,
        }
    }
}

impl fmt::Debug for RecordConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordConfig")
            .field("id_attribute", &self.id_attribute)
            .field("id_fn", &self.id_fn.is_some())
            .field("defaults", &self.defaults)
            .field("url_root", &self.url_root)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Serializable store settings.
///
/// `fetchSize` and `modelLimit` use `-1` for "not virtualized" and
/// "unbounded" respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub url: Option<String>,
    pub fetch_size: i64,
    pub model_limit: i64,
    /// Attribute comparator, comma-separated for composite keys
    pub comparator: Option<String>,
    pub sort_direction: SortDirection,
    pub record: RecordSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: None,
            fetch_size: -1,
            model_limit: -1,
            comparator: None,
            sort_direction: SortDirection::Ascending,
            record: RecordSettings::default(),
        }
    }
}

/// Runtime configuration of a [`Store`](crate::Store).
#[derive(Clone, Default)]
pub struct StoreConfig {
    pub url: Option<String>,
    /// Resolves the URL per request; falls back to `url` when it yields `None`
    pub custom_url: Option<CustomUrlFn>,
    /// Page size; `None` means everything is fetched at once
    pub fetch_size: Option<usize>,
    /// Maximum resident records; `None` means unbounded
    pub model_limit: Option<usize>,
    pub comparator: Option<Comparator>,
    pub sort_direction: SortDirection,
    /// Configuration of records the store creates from raw data
    pub record: Arc<RecordConfig>,
    pub adapter: Option<Arc<dyn SyncAdapter>>,
    /// Maps a raw response to paging metadata
    pub paging: Option<PagingFn>,
    /// Maps a raw response before data and paging are extracted
    pub parse: Option<ParseFn>,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: StoreSettings) -> Self {
        Self {
            url: settings.url,
            fetch_size: usize::try_from(settings.fetch_size).ok().filter(|n| *n > 0),
            model_limit: usize::try_from(settings.model_limit).ok(),
            comparator: settings.comparator.map(Comparator::Attribute),
            sort_direction: settings.sort_direction,
            record: Arc::new(RecordConfig::from_settings(settings.record)),
            ..Self::default()
        }
    }

    /// Parse JSON settings.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let settings: StoreSettings = serde_json::from_str(json)
            .map_err(|e| crate::Error::InvalidPayload(e.to_string()))?;
        Ok(Self::from_settings(settings))
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_custom_url<F>(mut self, f: F) -> Self
    where
        F: Fn(SyncMethod, &FetchParams) -> Option<String> + Send + Sync + 'static,
    {
        self.custom_url = Some(Arc::new(f));
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = Some(fetch_size).filter(|n| *n > 0);
        self
    }

    pub fn with_model_limit(mut self, model_limit: usize) -> Self {
        self.model_limit = Some(model_limit);
        self
    }

    pub fn with_comparator(mut self, comparator: impl Into<Comparator>) -> Self {
        self.comparator = Some(comparator.into());
        self
    }

    pub fn with_sort_direction(mut self, direction: SortDirection) -> Self {
        self.sort_direction = direction;
        self
    }

    pub fn with_record(mut self, record: RecordConfig) -> Self {
        self.record = Arc::new(record);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SyncAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_paging<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> PagingInfo + Send + Sync + 'static,
    {
        self.paging = Some(Arc::new(f));
        self
    }

    pub fn with_parse<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.parse = Some(Arc::new(f));
        self
    }

    /// URL for `method`, preferring the custom resolver.
    pub fn resolve_url(&self, method: SyncMethod, params: &FetchParams) -> Option<String> {
        self.custom_url
            .as_ref()
            .and_then(|f| f(method, params))
            .or_else(|| self.url.clone())
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("fetch_size", &self.fetch_size)
            .field("model_limit", &self.model_limit)
            .field("comparator", &self.comparator)
            .field("sort_direction", &self.sort_direction)
            .field("record", &self.record)
            .field("adapter", &self.adapter.is_some())
            .finish()
    }
}
