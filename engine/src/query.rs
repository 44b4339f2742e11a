//! Where-clauses: local matching and server query serialization.
//!
//! A [`Criteria`] is a set of attribute clauses that must all hold (AND).
//! A [`Query`] is a list of criteria of which any may hold (OR).
//!
//! Clauses compare an attribute against a value either by structural
//! equality, by a local predicate, or by an operator token that only the
//! server can evaluate. Serialization produces one flat token sequence:
//! clauses render as `attr<op>value`, clauses within a criteria are joined
//! with `;`, and criteria are joined with `,`. Attribute names and values
//! are percent-encoded so separators and operator characters inside them
//! stay unambiguous; operators are written as given.

use crate::{
    error::Result,
    value::{deep_equal_opt, display_value},
    Attributes, Error, Record,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub const AND_SEPARATOR: &str = ";";
pub const OR_SEPARATOR: &str = ",";

/// Characters escaped inside attribute names and values: the separators,
/// the characters operators are made of, and `%` itself.
const COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b';')
    .add(b',')
    .add(b'=')
    .add(b'<')
    .add(b'>')
    .add(b'!')
    .add(b'~')
    .add(b'&')
    .add(b'|')
    .add(b'+')
    .add(b'#')
    .add(b'?');

fn encode(component: &str) -> String {
    utf8_percent_encode(component, COMPONENT).to_string()
}

type PredicateFn = Arc<dyn Fn(&Record, &str, &Value) -> bool + Send + Sync>;
type OperatorFn = Arc<dyn Fn(&str, &Value) -> String + Send + Sync>;

/// Custom comparison attached to a clause.
#[derive(Clone)]
pub enum ClauseComparator {
    /// Evaluated locally as `(record, attribute, value) -> bool`
    Predicate(PredicateFn),
    /// Operator token for the server, e.g. `">="`
    Operator(String),
    /// Produces the operator token for the server
    OperatorFn(OperatorFn),
}

impl fmt::Debug for ClauseComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClauseComparator::Predicate(_) => f.write_str("Predicate(<fn>)"),
            ClauseComparator::Operator(op) => f.debug_tuple("Operator").field(op).finish(),
            ClauseComparator::OperatorFn(_) => f.write_str("OperatorFn(<fn>)"),
        }
    }
}

/// A single attribute condition.
#[derive(Debug, Clone)]
pub enum Clause {
    Equals(Value),
    Compare {
        value: Value,
        comparator: ClauseComparator,
    },
}

impl Clause {
    /// Interpret a raw clause value: `{"value": v, "comparator": "op"}`
    /// becomes an operator clause, anything else an equality clause.
    pub fn from_value(value: Value) -> Self {
        if let Value::Object(map) = &value {
            if let (Some(v), Some(Value::String(op)), 2) =
                (map.get("value"), map.get("comparator"), map.len())
            {
                return Clause::Compare {
                    value: v.clone(),
                    comparator: ClauseComparator::Operator(op.clone()),
                };
            }
        }
        Clause::Equals(value)
    }

    fn matches(&self, record: &Record, attribute: &str) -> Result<bool> {
        match self {
            Clause::Equals(value) => Ok(deep_equal_opt(record.get(attribute).as_ref(), Some(value))),
            Clause::Compare { value, comparator } => match comparator {
                ClauseComparator::Predicate(f) => Ok(f(record, attribute, value)),
                ClauseComparator::Operator(op) => Err(Error::ServerOnlyComparator {
                    attribute: attribute.to_string(),
                    operator: op.clone(),
                }),
                ClauseComparator::OperatorFn(f) => Err(Error::ServerOnlyComparator {
                    attribute: attribute.to_string(),
                    operator: f(attribute, value),
                }),
            },
        }
    }

    fn to_token(&self, attribute: &str) -> Result<String> {
        let operator = match self {
            Clause::Equals(_) => "=".to_string(),
            Clause::Compare { value, comparator } => match comparator {
                ClauseComparator::Operator(op) => op.clone(),
                ClauseComparator::OperatorFn(f) => f(attribute, value),
                ClauseComparator::Predicate(_) => {
                    return Err(Error::LocalOnlyComparator(attribute.to_string()))
                }
            },
        };
        let value = match self {
            Clause::Equals(value) | Clause::Compare { value, .. } => value,
        };
        Ok(format!(
            "{}{}{}",
            encode(attribute),
            operator,
            encode(&display_value(value))
        ))
    }
}

/// Clauses that must all hold.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    clauses: Vec<(String, Clause)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Equality clauses for every attribute in `attrs`, honouring the
    /// `{"value", "comparator"}` operator form.
    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self {
            clauses: attrs
                .iter()
                .map(|(k, v)| (k.clone(), Clause::from_value(v.clone())))
                .collect(),
        }
    }

    pub fn with(mut self, attribute: impl Into<String>, clause: Clause) -> Self {
        self.clauses.push((attribute.into(), clause));
        self
    }

    pub fn eq(self, attribute: impl Into<String>, value: Value) -> Self {
        self.with(attribute, Clause::Equals(value))
    }

    pub fn operator(
        self,
        attribute: impl Into<String>,
        operator: impl Into<String>,
        value: Value,
    ) -> Self {
        self.with(
            attribute,
            Clause::Compare {
                value,
                comparator: ClauseComparator::Operator(operator.into()),
            },
        )
    }

    pub fn predicate<F>(self, attribute: impl Into<String>, value: Value, f: F) -> Self
    where
        F: Fn(&Record, &str, &Value) -> bool + Send + Sync + 'static,
    {
        self.with(
            attribute,
            Clause::Compare {
                value,
                comparator: ClauseComparator::Predicate(Arc::new(f)),
            },
        )
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Evaluate against `record`. Fails on clauses only the server can
    /// evaluate.
    pub fn matches(&self, record: &Record) -> Result<bool> {
        for (attribute, clause) in &self.clauses {
            if !clause.matches(record, attribute)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Serialize for the server. Fails on local-only predicates.
    pub fn to_query_string(&self) -> Result<String> {
        let tokens = self
            .clauses
            .iter()
            .map(|(attribute, clause)| clause.to_token(attribute))
            .collect::<Result<Vec<_>>>()?;
        Ok(tokens.join(AND_SEPARATOR))
    }
}

/// Alternatives of which any may hold.
#[derive(Debug, Clone, Default)]
pub struct Query {
    alternatives: Vec<Criteria>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn or(mut self, criteria: Criteria) -> Self {
        self.alternatives.push(criteria);
        self
    }

    pub fn alternatives(&self) -> &[Criteria] {
        &self.alternatives
    }

    /// Evaluate against `record`. An empty query matches everything.
    pub fn matches(&self, record: &Record) -> Result<bool> {
        if self.alternatives.is_empty() {
            return Ok(true);
        }
        for criteria in &self.alternatives {
            if criteria.matches(record)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn to_query_string(&self) -> Result<String> {
        let groups = self
            .alternatives
            .iter()
            .filter(|c| !c.is_empty())
            .map(Criteria::to_query_string)
            .collect::<Result<Vec<_>>>()?;
        Ok(groups.join(OR_SEPARATOR))
    }
}

impl From<Criteria> for Query {
    fn from(criteria: Criteria) -> Self {
        Query::new().or(criteria)
    }
}

impl From<&Attributes> for Query {
    fn from(attrs: &Attributes) -> Self {
        Criteria::from_attributes(attrs).into()
    }
}

impl From<Attributes> for Query {
    fn from(attrs: Attributes) -> Self {
        Query::from(&attrs)
    }
}

impl From<Vec<Criteria>> for Query {
    fn from(alternatives: Vec<Criteria>) -> Self {
        Query { alternatives }
    }
}
