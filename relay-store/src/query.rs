//! Table queries: equality filters and ordering.

use serde_json::Value;
use std::cmp::Ordering;

/// Sort order for a query's result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// A query over one table.
///
/// Ordering applies to result sets (`Store::list` and the initial snapshot
/// of a change cursor); live changes are delivered in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    filters: Vec<(String, Value)>,
    order_by: Option<OrderBy>,
}

impl Query {
    /// Selects every document in `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    /// Keeps only documents whose top-level `field` equals `value`.
    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Returns true if the document passes every filter.
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value))
    }

    /// Sorts `(insertion sequence, document)` pairs by this query's order.
    /// Ties, and queries without an order, fall back to insertion order.
    pub(crate) fn sort(&self, rows: &mut [(u64, Value)]) {
        match &self.order_by {
            Some(order) => rows.sort_by(|(seq_a, a), (seq_b, b)| {
                let ord = compare_values(
                    a.get(&order.field).unwrap_or(&Value::Null),
                    b.get(&order.field).unwrap_or(&Value::Null),
                );
                let ord = if order.descending { ord.reverse() } else { ord };
                ord.then(seq_a.cmp(seq_b))
            }),
            None => rows.sort_by_key(|(seq, _)| *seq),
        }
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
