//! Sort policy: comparator variants and direction.

use crate::{value::compare_values, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Sort direction applied to attribute and key comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    #[serde(rename = "asc", alias = "ascending")]
    Ascending,
    #[serde(rename = "desc", alias = "descending")]
    Descending,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        }
    }

    /// Apply the direction to an ascending ordering.
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

type KeyFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;
type CompareFn = Arc<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;

/// How records are ordered.
#[derive(Clone)]
pub enum Comparator {
    /// One attribute name, or several comma-separated for a composite key.
    Attribute(String),
    /// Key extractor. An array key compares element by element.
    Key(KeyFn),
    /// Full comparator, used as-is without applying a direction.
    Compare(CompareFn),
}

impl Comparator {
    pub fn attribute(name: impl Into<String>) -> Self {
        Comparator::Attribute(name.into())
    }

    pub fn key<F>(f: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        Comparator::Key(Arc::new(f))
    }

    pub fn compare<F>(f: F) -> Self
    where
        F: Fn(&Record, &Record) -> Ordering + Send + Sync + 'static,
    {
        Comparator::Compare(Arc::new(f))
    }

    /// Attribute names making up an attribute comparator.
    pub fn attributes(&self) -> Option<Vec<&str>> {
        match self {
            Comparator::Attribute(names) => Some(
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Sort order the server can apply, if any.
    pub fn server_sort(&self) -> Option<&str> {
        match self {
            Comparator::Attribute(names) => Some(names.as_str()),
            _ => None,
        }
    }

    /// Whether a change to `changed` attributes can affect ordering.
    ///
    /// Function comparators are opaque, so any change counts.
    pub fn is_affected_by<S: AsRef<str>>(&self, changed: &[S]) -> bool {
        if changed.is_empty() {
            return false;
        }
        match self.attributes() {
            Some(attrs) => changed.iter().any(|c| attrs.contains(&c.as_ref())),
            None => true,
        }
    }

    fn sort_key(&self, record: &Record) -> Vec<Option<Value>> {
        match self {
            Comparator::Attribute(_) => self
                .attributes()
                .unwrap_or_default()
                .into_iter()
                .map(|attr| record.get(attr))
                .collect(),
            Comparator::Key(f) => vec![Some(f(record))],
            Comparator::Compare(_) => Vec::new(),
        }
    }

    /// Compare two records.
    pub fn cmp_records(&self, a: &Record, b: &Record, direction: SortDirection) -> Ordering {
        match self {
            Comparator::Compare(f) => f(a, b),
            _ => direction.apply(compare_keys(&self.sort_key(a), &self.sort_key(b))),
        }
    }

    /// Stable sort of `records`.
    pub fn sort(&self, records: &mut Vec<Record>, direction: SortDirection) {
        match self {
            Comparator::Compare(f) => records.sort_by(|a, b| f(a, b)),
            _ => {
                let mut keyed: Vec<(Vec<Option<Value>>, Record)> = records
                    .drain(..)
                    .map(|r| (self.sort_key(&r), r))
                    .collect();
                keyed.sort_by(|(a, _), (b, _)| direction.apply(compare_keys(a, b)));
                records.extend(keyed.into_iter().map(|(_, r)| r));
            }
        }
    }

    /// Insertion point for `record` in already-sorted `records`, placed after
    /// any elements that compare equal.
    pub fn sorted_index(
        &self,
        records: &[Record],
        record: &Record,
        direction: SortDirection,
    ) -> usize {
        records.partition_point(|r| self.cmp_records(r, record, direction) != Ordering::Greater)
    }
}

fn compare_keys(a: &[Option<Value>], b: &[Option<Value>]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match compare_values(x.as_ref(), y.as_ref()) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Attribute(names) => f.debug_tuple("Attribute").field(names).finish(),
            Comparator::Key(_) => f.write_str("Key(<fn>)"),
            Comparator::Compare(_) => f.write_str("Compare(<fn>)"),
        }
    }
}

impl From<&str> for Comparator {
    fn from(name: &str) -> Self {
        Comparator::Attribute(name.to_string())
    }
}

impl From<String> for Comparator {
    fn from(name: String) -> Self {
        Comparator::Attribute(name)
    }
}
