//! Triple patterns for [`Store::get_triples`](crate::Store::get_triples).
//!
//! Which positions are bound decides which index is walked:
//!
//! | bound | walk                                |
//! |-------|-------------------------------------|
//! | e     | `eav[e]`                            |
//! | ea    | `eav[e][a]`                         |
//! | eav   | `eav[e][a]` filtered by value       |
//! | ev    | every `eav[e][*]` filtered by value |
//! | a     | `aev[a]`                            |
//! | av    | every `aev[a][*]` filtered by value |
//! | v     | full scan filtered by value         |
//! | -     | everything                          |

use crate::attrs::AttrId;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub fn from_op(op: &str) -> Option<Self> {
        match op {
            "$gt" => Some(Comparator::Gt),
            "$gte" => Some(Comparator::Gte),
            "$lt" => Some(Comparator::Lt),
            "$lte" => Some(Comparator::Lte),
            _ => None,
        }
    }

    /// `candidate <op> bound`; values of different kinds never compare.
    pub fn matches(self, candidate: &Value, bound: &Value) -> bool {
        let Some(ord) = compare_values(candidate, bound) else {
            return false;
        };
        match self {
            Comparator::Gt => ord == Ordering::Greater,
            Comparator::Gte => ord != Ordering::Less,
            Comparator::Lt => ord == Ordering::Less,
            Comparator::Lte => ord != Ordering::Greater,
        }
    }
}

/// Ordering between two scalars of the same JSON kind.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Predicate over the value position.
#[derive(Debug, Clone, PartialEq)]
pub enum ValuePattern {
    Eq(Value),
    In(Vec<Value>),
    Not(Value),
    /// Keep candidates (ref targets when `reverse`, else entities) for which
    /// `attr_id` has no value (or has one, when `is_null` is false).
    IsNull {
        attr_id: AttrId,
        is_null: bool,
        reverse: bool,
    },
    Compare(Comparator, Value),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriplePattern {
    pub entity: Option<String>,
    pub attr_id: Option<AttrId>,
    pub value: Option<ValuePattern>,
}

impl TriplePattern {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn entity(mut self, e: impl Into<String>) -> Self {
        self.entity = Some(e.into());
        self
    }

    pub fn attr(mut self, a: impl Into<String>) -> Self {
        self.attr_id = Some(a.into());
        self
    }

    pub fn value(mut self, v: ValuePattern) -> Self {
        self.value = Some(v);
        self
    }

    pub fn eq(self, v: Value) -> Self {
        self.value(ValuePattern::Eq(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_comparators_ignore_mismatched_kinds() {
        assert!(Comparator::Gt.matches(&json!(3), &json!(2)));
        assert!(Comparator::Lte.matches(&json!("a"), &json!("a")));
        assert!(!Comparator::Lt.matches(&json!("1"), &json!(2)));
    }
}
