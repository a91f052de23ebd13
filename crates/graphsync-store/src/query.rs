//! Evaluating `{etype: form}` queries against a [`Store`].
//!
//! A form is an object whose non-`$` keys are link labels (each with its own
//! nested form) and whose `$` key holds options:
//!
//! ```json
//! { "users": { "$": { "where": { "age": { "$gt": 20 } }, "limit": 10,
//!                    "order": { "serverCreatedAt": "desc" } },
//!              "posts": {} } }
//! ```
//!
//! Results mirror the query: `{ "users": [ { "id": .., "name": .., "posts": [..] } ] }`.

use crate::attrs::Attr;
use crate::error::StoreError;
use crate::pattern::Comparator;
use crate::Store;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Default)]
struct FormOptions<'a> {
    where_clause: Option<&'a Map<String, Value>>,
    limit: Option<usize>,
    direction: Direction,
}

impl<'a> FormOptions<'a> {
    fn parse(etype: &str, form: &'a Map<String, Value>) -> Result<Self, StoreError> {
        let mut opts = FormOptions::default();
        let Some(raw) = form.get("$") else {
            return Ok(opts);
        };
        let raw = raw
            .as_object()
            .ok_or_else(|| StoreError::Query(format!("{etype}: `$` must be an object")))?;

        if let Some(w) = raw.get("where") {
            opts.where_clause = Some(
                w.as_object()
                    .ok_or_else(|| StoreError::Query(format!("{etype}: `where` must be an object")))?,
            );
        }
        if let Some(limit) = raw.get("limit") {
            let limit = limit
                .as_u64()
                .ok_or_else(|| StoreError::Query(format!("{etype}: `limit` must be a positive integer")))?;
            opts.limit = Some(limit as usize);
        }
        if let Some(order) = raw.get("order").and_then(Value::as_object) {
            opts.direction = match order.get("serverCreatedAt").and_then(Value::as_str) {
                Some("desc") => Direction::Desc,
                Some("asc") | None => Direction::Asc,
                Some(other) => {
                    return Err(StoreError::Query(format!(
                        "{etype}: unknown order direction {other}"
                    )))
                }
            };
        }
        Ok(opts)
    }
}

/// Evaluate `query` against `store`.
pub fn evaluate(store: &Store, query: &Value) -> Result<Value, StoreError> {
    let query = query
        .as_object()
        .ok_or_else(|| StoreError::Query("query must be an object".to_string()))?;
    let mut out = Map::new();
    for (etype, form) in query {
        let rows = query_etype(store, etype, form, None)?;
        out.insert(etype.clone(), Value::Array(rows));
    }
    Ok(Value::Object(out))
}

fn query_etype(
    store: &Store,
    etype: &str,
    form: &Value,
    restrict_to: Option<&[String]>,
) -> Result<Vec<Value>, StoreError> {
    let empty = Map::new();
    let form = match form {
        Value::Object(m) => m,
        Value::Null => &empty,
        _ => return Err(StoreError::Query(format!("{etype}: form must be an object"))),
    };
    let opts = FormOptions::parse(etype, form)?;

    let Some(id_attr) = store.attrs().primary_key(etype) else {
        return Ok(Vec::new());
    };

    let created_at = |eid: &str| {
        store
            .entity_attr_leaf(eid, &id_attr.id)
            .and_then(|leaf| leaf.values().map(|t| t.created_at).min())
    };

    let mut rows: Vec<(i64, String)> = match restrict_to {
        Some(ids) => ids
            .iter()
            .filter_map(|eid| created_at(eid).map(|t| (t, eid.clone())))
            .collect(),
        None => store
            .entities_with_attr(&id_attr.id)
            .filter_map(|(eid, leaf)| {
                leaf.values()
                    .map(|t| t.created_at)
                    .min()
                    .map(|t| (t, eid.clone()))
            })
            .collect(),
    };

    if let Some(where_clause) = opts.where_clause {
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if matches_where(store, etype, &row.1, where_clause)? {
                kept.push(row);
            }
        }
        rows = kept;
    }

    rows.sort();
    rows.dedup();
    if opts.direction == Direction::Desc {
        rows.reverse();
    }
    if let Some(limit) = opts.limit {
        rows.truncate(limit);
    }

    rows.into_iter()
        .map(|(_, eid)| build_object(store, etype, &eid, form))
        .collect()
}

fn build_object(
    store: &Store,
    etype: &str,
    eid: &str,
    form: &Map<String, Value>,
) -> Result<Value, StoreError> {
    let mut obj = store.entity_as_object(etype, eid);
    obj.entry("id".to_string())
        .or_insert_with(|| Value::String(eid.to_string()));

    for (label, child_form) in form.iter().filter(|(k, _)| k.as_str() != "$") {
        let singular = is_singular(store, etype, label);
        let child = match resolve_link(store, etype, label, eid) {
            Some((child_etype, targets)) => {
                let mut children = query_etype(store, &child_etype, child_form, Some(&targets))?;
                if singular {
                    if children.is_empty() {
                        Value::Null
                    } else {
                        children.swap_remove(0)
                    }
                } else {
                    Value::Array(children)
                }
            }
            None if singular => Value::Null,
            None => Value::Array(Vec::new()),
        };
        obj.insert(label.clone(), child);
    }
    Ok(Value::Object(obj))
}

/// Forward or reverse ref attribute named `label` on `etype`.
fn link_attr<'a>(store: &'a Store, etype: &str, label: &str) -> Option<(&'a Attr, bool)> {
    if let Some(attr) = store
        .attrs()
        .by_forward_label(etype, label)
        .filter(|a| a.is_ref())
    {
        return Some((attr, true));
    }
    store
        .attrs()
        .by_reverse_label(etype, label)
        .filter(|a| a.is_ref())
        .map(|attr| (attr, false))
}

/// Target etype and ids reached from `eid` through `label`.
fn resolve_link(store: &Store, etype: &str, label: &str, eid: &str) -> Option<(String, Vec<String>)> {
    let (attr, forward) = link_attr(store, etype, label)?;
    if forward {
        let child_etype = attr.reverse_etype()?.to_string();
        let targets = store
            .values(eid, &attr.id)
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        Some((child_etype, targets))
    } else {
        let targets = store
            .referrers(eid, &attr.id)
            .into_iter()
            .map(str::to_string)
            .collect();
        Some((attr.forward_etype().to_string(), targets))
    }
}

fn is_singular(store: &Store, etype: &str, label: &str) -> bool {
    if !store.cardinality_inference() {
        return false;
    }
    let from_index = store
        .link_index()
        .and_then(|idx| idx.get(etype))
        .and_then(|labels| labels.get(label))
        .map(|info| info.singular());
    if let Some(singular) = from_index {
        return singular;
    }
    match link_attr(store, etype, label) {
        Some((attr, true)) => attr.has_single_value(),
        Some((attr, false)) => attr.unique,
        None => false,
    }
}

// ============================================================================
// Where
// ============================================================================

fn matches_where(
    store: &Store,
    etype: &str,
    eid: &str,
    where_clause: &Map<String, Value>,
) -> Result<bool, StoreError> {
    for (key, cond) in where_clause {
        let ok = match key.as_str() {
            "or" | "and" => {
                let clauses = cond
                    .as_array()
                    .ok_or_else(|| StoreError::Query(format!("`{key}` takes an array")))?;
                let mut results = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let clause = clause
                        .as_object()
                        .ok_or_else(|| StoreError::Query(format!("`{key}` clauses must be objects")))?;
                    results.push(matches_where(store, etype, eid, clause)?);
                }
                if key == "or" {
                    results.into_iter().any(|r| r)
                } else {
                    results.into_iter().all(|r| r)
                }
            }
            label => {
                let values = values_for_label(store, etype, eid, label);
                matches_condition(&values, cond)?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn values_for_label(store: &Store, etype: &str, eid: &str, label: &str) -> Vec<Value> {
    if label == "id" {
        return vec![Value::String(eid.to_string())];
    }
    if let Some(attr) = store.attrs().by_forward_label(etype, label) {
        return store.values(eid, &attr.id).into_iter().cloned().collect();
    }
    if let Some(attr) = store.attrs().by_reverse_label(etype, label) {
        return store
            .referrers(eid, &attr.id)
            .into_iter()
            .map(|e| Value::String(e.to_string()))
            .collect();
    }
    Vec::new()
}

fn matches_condition(values: &[Value], cond: &Value) -> Result<bool, StoreError> {
    let Some(ops) = cond.as_object().filter(|m| m.keys().any(|k| k.starts_with('$'))) else {
        return Ok(values.iter().any(|v| v == cond));
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$in" => {
                let options = arg
                    .as_array()
                    .ok_or_else(|| StoreError::Query("`$in` takes an array".to_string()))?;
                values.iter().any(|v| options.contains(v))
            }
            "$not" => values.iter().all(|v| v != arg),
            "$isNull" => {
                let want_null = arg
                    .as_bool()
                    .ok_or_else(|| StoreError::Query("`$isNull` takes a boolean".to_string()))?;
                values.iter().all(Value::is_null) == want_null
            }
            other => match Comparator::from_op(other) {
                Some(cmp) => values.iter().any(|v| cmp.matches(v, arg)),
                None => return Err(StoreError::Query(format!("unknown operator {other}"))),
            },
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}
