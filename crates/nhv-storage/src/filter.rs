//! Typed equality filters rendered into parameterised `WHERE` clauses.

use chrono::{DateTime, Utc};
use nhv_core::ItemType;
use sqlx::{Postgres, QueryBuilder};

/// A column an entity can be filtered on. Names are static so they never come
/// from user input.
pub trait Column: Copy + Send + Sync + 'static {
    fn name(self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Null,
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<ItemType> for FilterValue {
    fn from(value: ItemType) -> Self {
        FilterValue::Text(value.as_str().to_string())
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Float(value)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(value: DateTime<Utc>) -> Self {
        FilterValue::Timestamp(value)
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FilterValue::Null, Into::into)
    }
}

/// Conjunction of `column = value` conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter<C> {
    conditions: Vec<(C, FilterValue)>,
}

impl<C> Default for Filter<C> {
    fn default() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }
}

impl<C: Column> Filter<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: C, value: impl Into<FilterValue>) -> Self {
        self.conditions.push((column, value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[(C, FilterValue)] {
        &self.conditions
    }

    pub(crate) fn push_where(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        for (position, (column, value)) in self.conditions.iter().enumerate() {
            qb.push(if position == 0 { " WHERE " } else { " AND " });
            qb.push(column.name());
            match value {
                FilterValue::Null => {
                    qb.push(" IS NULL");
                }
                FilterValue::Text(v) => {
                    qb.push(" = ").push_bind(v.clone());
                }
                FilterValue::Int(v) => {
                    qb.push(" = ").push_bind(*v);
                }
                FilterValue::Float(v) => {
                    qb.push(" = ").push_bind(*v);
                }
                FilterValue::Timestamp(v) => {
                    qb.push(" = ").push_bind(*v);
                }
            }
        }
    }
}
