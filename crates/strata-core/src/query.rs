//! Query/Cursor vocabulary shared by every backend: ordering plus
//! directional comparison plus an optional exclusive-start value ("since"),
//! and equality/membership filters per attribute.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scan direction relative to the ordering attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

/// An equality or membership filter on a single attribute. An empty `In`
/// collapses to an always-false condition; the engine short-circuits it
/// without a backend round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq(Value),
    In(Vec<Value>),
}

impl Filter {
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let value = value.unwrap_or(&Value::Null);
        match self {
            Filter::Eq(expected) => value == expected,
            Filter::In(set) => set.iter().any(|v| v == value),
        }
    }
}

/// A value written by `update`/`upsert`. `Increment` composes correctly
/// under concurrency: backends translate it to an atomic read-add
/// (`col = COALESCE(col, 0) + n` in SQL).
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    Set(Value),
    Increment(i64),
}

/// Ordered attribute-to-value assignments for a mutation.
pub type WriteSet = Vec<(String, WriteValue)>;

/// Apply a write set to an item in place. Used by backends without a SQL
/// layer; increments treat a missing or null counter as zero.
pub fn apply_write_set(item: &mut Value, changes: &WriteSet) {
    let obj = match item.as_object_mut() {
        Some(obj) => obj,
        None => return,
    };
    for (name, change) in changes {
        match change {
            WriteValue::Set(value) => {
                obj.insert(name.clone(), value.clone());
            }
            WriteValue::Increment(n) => {
                let current = obj.get(name).and_then(Value::as_i64).unwrap_or(0);
                obj.insert(name.clone(), Value::from(current + n));
            }
        }
    }
}

/// True when any membership filter is the empty set. The whole conjunction
/// is then unsatisfiable and no backend round trip is needed.
pub fn has_empty_membership(filters: &[(String, Filter)]) -> bool {
    filters
        .iter()
        .any(|(_, f)| matches!(f, Filter::In(set) if set.is_empty()))
}

/// A query: ordering attribute + direction + optional exclusive "since"
/// bound, plus zero or more filters on other attributes.
///
/// `since` is always interpreted relative to the declared ordering attribute
/// and direction, never any other attribute.
#[derive(Debug, Clone)]
pub struct Query {
    pub ordering: String,
    pub direction: Direction,
    pub since: Option<Value>,
    pub filters: Vec<(String, Filter)>,
    pub fetch_size: usize,
}

/// Default number of rows fetched per page.
pub const DEFAULT_FETCH_SIZE: usize = 100;

impl Query {
    pub fn new(ordering: &str) -> Self {
        Self {
            ordering: ordering.to_string(),
            direction: Direction::Asc,
            since: None,
            filters: Vec::new(),
            fetch_size: DEFAULT_FETCH_SIZE,
        }
    }

    pub fn descending(mut self) -> Self {
        self.direction = Direction::Desc;
        self
    }

    /// Continue strictly after this ordering value (exclusive bound).
    pub fn since(mut self, value: Value) -> Self {
        self.since = Some(value);
        self
    }

    pub fn filter(mut self, attribute: &str, filter: Filter) -> Self {
        self.filters.push((attribute.to_string(), filter));
        self
    }

    pub fn fetch_size(mut self, n: usize) -> Self {
        self.fetch_size = n.max(1);
        self
    }

    /// Whether an item passes all filters and the exclusive `since` bound.
    pub fn admits(&self, item: &Value) -> bool {
        if !self
            .filters
            .iter()
            .all(|(name, f)| f.matches(item.get(name)))
        {
            return false;
        }
        match &self.since {
            None => true,
            Some(bound) => {
                let value = item.get(&self.ordering).unwrap_or(&Value::Null);
                match (compare_values(value, bound), self.direction) {
                    (Some(Ordering::Greater), Direction::Asc) => true,
                    (Some(Ordering::Less), Direction::Desc) => true,
                    _ => false,
                }
            }
        }
    }

    /// Sort rows by the ordering attribute in the declared direction.
    /// Values of incomparable types sort as equal, preserving input order.
    pub fn sort(&self, rows: &mut [Value]) {
        rows.sort_by(|a, b| {
            let av = a.get(&self.ordering).unwrap_or(&Value::Null);
            let bv = b.get(&self.ordering).unwrap_or(&Value::Null);
            let ord = compare_values(av, bv).unwrap_or(Ordering::Equal);
            match self.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        });
    }
}

/// One fetch's worth of results plus the cursor to continue from.
///
/// If `next` is `None` the caller has seen every matching record up to the
/// scan boundary at call time. Otherwise re-issuing the query with
/// `since = next` continues strictly after the last returned record.
#[derive(Debug, Clone)]
pub struct Page {
    pub results: Vec<Value>,
    pub next: Option<Value>,
}

/// Compare two scalar JSON values. Numbers compare numerically, strings
/// lexicographically, booleans false-before-true. Nulls order before
/// everything. Mixed or structured types are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN).partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_eq_and_in() {
        assert!(Filter::Eq(json!("a")).matches(Some(&json!("a"))));
        assert!(!Filter::Eq(json!("a")).matches(Some(&json!("b"))));
        assert!(Filter::In(vec![json!(1), json!(2)]).matches(Some(&json!(2))));
        assert!(!Filter::In(vec![]).matches(Some(&json!(1))));
        assert!(Filter::Eq(Value::Null).matches(None));
    }

    #[test]
    fn test_empty_membership_short_circuit() {
        let filters = vec![
            ("a".to_string(), Filter::Eq(json!(1))),
            ("b".to_string(), Filter::In(vec![])),
        ];
        assert!(has_empty_membership(&filters));
        assert!(!has_empty_membership(&filters[..1]));
    }

    #[test]
    fn test_since_is_exclusive_and_directional() {
        let q = Query::new("n").since(json!(5));
        assert!(!q.admits(&json!({"n": 5})));
        assert!(!q.admits(&json!({"n": 4})));
        assert!(q.admits(&json!({"n": 6})));

        let q = Query::new("n").descending().since(json!(5));
        assert!(q.admits(&json!({"n": 4})));
        assert!(!q.admits(&json!({"n": 5})));
        assert!(!q.admits(&json!({"n": 6})));
    }

    #[test]
    fn test_admits_applies_filters() {
        let q = Query::new("n").filter("kind", Filter::Eq(json!("x")));
        assert!(q.admits(&json!({"n": 1, "kind": "x"})));
        assert!(!q.admits(&json!({"n": 1, "kind": "y"})));
        assert!(!q.admits(&json!({"n": 1})));
    }

    #[test]
    fn test_sort_directional() {
        let q = Query::new("n");
        let mut rows = vec![json!({"n": 2}), json!({"n": 1}), json!({"n": 3})];
        q.sort(&mut rows);
        assert_eq!(rows[0]["n"], 1);
        let q = q.descending();
        q.sort(&mut rows);
        assert_eq!(rows[0]["n"], 3);
    }

    #[test]
    fn test_apply_write_set_increment_treats_missing_as_zero() {
        let mut item = json!({"id": "a", "count": 2});
        apply_write_set(
            &mut item,
            &vec![
                ("count".to_string(), WriteValue::Increment(3)),
                ("other".to_string(), WriteValue::Increment(-1)),
                ("name".to_string(), WriteValue::Set(json!("x"))),
            ],
        );
        assert_eq!(item, json!({"id": "a", "count": 5, "other": -1, "name": "x"}));
    }

    #[test]
    fn test_compare_values_cross_types() {
        assert_eq!(
            compare_values(&json!(1), &json!(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
        assert_eq!(
            compare_values(&Value::Null, &json!(0)),
            Some(Ordering::Less)
        );
    }
}
