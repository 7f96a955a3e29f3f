//! Parameterized predicate construction.
//!
//! Field names are interpolated into the query text verbatim and must come
//! from code, never from request input. Values always travel as positional
//! arguments (`?1`, `?2`, ...).

use std::fmt::{Display, Formatter};

use time::OffsetDateTime;

use crate::retrieval::TimeChunk;
use crate::{parse_rfc3339, timestamp_to_nanos_saturating, EventFilter};

pub const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Like,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Like => "LIKE",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A positional query argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryArg {
    Text(String),
    Integer(i64),
}

impl QueryArg {
    /// Timestamps bind as epoch nanoseconds, saturating at the storable
    /// range so every bound still constrains the query.
    #[must_use]
    pub fn timestamp(value: OffsetDateTime) -> Self {
        Self::Integer(timestamp_to_nanos_saturating(value))
    }

    fn is_blank(&self) -> bool {
        matches!(self, Self::Text(text) if text.is_empty())
    }
}

impl From<&str> for QueryArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for QueryArg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for QueryArg {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub field: String,
    pub operator: Operator,
    pub slot: usize,
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ?{}", self.field, self.operator.as_sql(), self.slot)
    }
}

/// Finished query text plus its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub sql: String,
    pub args: Vec<QueryArg>,
}

/// Ordered predicates and the arguments their slots refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredicateSet {
    predicates: Vec<Predicate>,
    args: Vec<QueryArg>,
}

impl PredicateSet {
    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    #[must_use]
    pub fn args(&self) -> &[QueryArg] {
        &self.args
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    fn push(&mut self, field: &str, operator: Operator, value: QueryArg) {
        let slot = self.args.len() + 1;
        self.predicates.push(Predicate {
            field: field.to_string(),
            operator,
            slot,
        });
        self.args.push(value);
    }

    /// Appends the predicates to `base` with `AND`, then the optional
    /// ordering, row cap and offset. A zero limit or offset is omitted.
    #[must_use]
    pub fn build(
        &self,
        base: &str,
        order_by: Option<&str>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Query {
        let mut sql = base.trim_end().to_string();

        for predicate in &self.predicates {
            sql.push_str(&format!(" AND {predicate}"));
        }

        if let Some(order_by) = order_by.filter(|value| !value.is_empty()) {
            sql.push_str(&format!(" ORDER BY {order_by}"));
        }

        if let Some(limit) = limit.filter(|value| *value > 0) {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = offset.filter(|value| *value > 0) {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        Query {
            sql,
            args: self.args.clone(),
        }
    }
}

/// Single-owner accumulator of optional conditions.
///
/// Every method consumes the builder, so one instance can never be mutated
/// from two places.
#[derive(Debug, Default)]
#[must_use]
pub struct PredicateBuilder {
    set: PredicateSet,
}

impl PredicateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_equality(self, field: &str, value: Option<QueryArg>) -> Self {
        self.add_condition(field, Operator::Eq, value)
    }

    /// Appends `field operator ?n` unless the value is absent or an empty
    /// string.
    pub fn add_condition(mut self, field: &str, operator: Operator, value: Option<QueryArg>) -> Self {
        match value {
            Some(value) if !value.is_blank() => {
                self.set.push(field, operator, value);
                self
            }
            _ => self,
        }
    }

    /// Applies every dimension of `filter` in a fixed order.
    ///
    /// Time bounds that fail to parse are dropped rather than reported.
    pub fn add_filters(self, filter: &EventFilter) -> Self {
        let builder = self.add_attribute_filters(filter);
        let from = time_bound(filter.from.as_deref(), "from");
        let to = time_bound(filter.to.as_deref(), "to");

        builder
            .add_condition(TIMESTAMP_FIELD, Operator::Gte, from)
            .add_condition(TIMESTAMP_FIELD, Operator::Lte, to)
    }

    /// Applies every non-time dimension of `filter`.
    pub fn add_attribute_filters(self, filter: &EventFilter) -> Self {
        let path = filter
            .path
            .as_deref()
            .filter(|path| !path.is_empty())
            .map(|path| QueryArg::Text(format!("%{path}%")));

        self.add_equality("service", text(filter.service.as_deref()))
            .add_equality("event", text(filter.event.as_deref()))
            .add_equality("referrer", text(filter.referrer.as_deref()))
            .add_equality("user_browser", text(filter.user_browser.as_deref()))
            .add_equality("user_device", text(filter.user_device.as_deref()))
            .add_condition("path", Operator::Like, path)
    }

    /// Bounds the timestamp to one chunk: `>= start` and `< end`, or
    /// `<= end` when the chunk closes the scanned range.
    pub fn add_time_window(self, chunk: &TimeChunk) -> Self {
        let upper = if chunk.end_inclusive {
            Operator::Lte
        } else {
            Operator::Lt
        };

        self.add_condition(
            TIMESTAMP_FIELD,
            Operator::Gte,
            Some(QueryArg::timestamp(chunk.start)),
        )
        .add_condition(TIMESTAMP_FIELD, upper, Some(QueryArg::timestamp(chunk.end)))
    }

    #[must_use]
    pub fn predicate_set(&self) -> &PredicateSet {
        &self.set
    }

    #[must_use]
    pub fn finish(self) -> PredicateSet {
        self.set
    }

    #[must_use]
    pub fn build(
        self,
        base: &str,
        order_by: Option<&str>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Query {
        self.set.build(base, order_by, limit, offset)
    }
}

fn text(value: Option<&str>) -> Option<QueryArg> {
    value.map(QueryArg::from)
}

fn time_bound(raw: Option<&str>, label: &str) -> Option<QueryArg> {
    let raw = raw.filter(|value| !value.is_empty())?;
    match parse_rfc3339(raw) {
        Ok(parsed) => Some(QueryArg::timestamp(parsed)),
        Err(err) => {
            tracing::debug!(bound = label, value = raw, error = %err, "ignoring unparseable time bound");
            None
        }
    }
}
