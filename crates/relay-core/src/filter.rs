//! Record filter evaluation and field projection for in-memory stores.
//!
//! Supports the operator subset the gateway's fixtures and development
//! server rely on: `_and`, `_or`, `_eq`, `_neq`, `_in`, `_nin`, `_null`,
//! `_nnull`, `_gt`, `_gte`, `_lt`, `_lte`, `_contains`. Nested objects without
//! an operator key descend into the record's sub-object.

use std::cmp::Ordering;

use serde_json::{Map, Value as JsonValue};

/// True when `record` satisfies `filter`. A non-object filter matches everything.
pub fn matches(record: &JsonValue, filter: &JsonValue) -> bool {
    let Some(clauses) = filter.as_object() else {
        return true;
    };
    clauses.iter().all(|(key, clause)| match key.as_str() {
        "_and" => clause
            .as_array()
            .map(|parts| parts.iter().all(|f| matches(record, f)))
            .unwrap_or(false),
        "_or" => clause
            .as_array()
            .map(|parts| parts.iter().any(|f| matches(record, f)))
            .unwrap_or(false),
        field => field_matches(record.get(field).unwrap_or(&JsonValue::Null), clause),
    })
}

fn field_matches(value: &JsonValue, clause: &JsonValue) -> bool {
    let Some(ops) = clause.as_object() else {
        return value == clause;
    };
    if !ops.keys().any(|k| k.starts_with('_')) {
        return matches(value, clause);
    }
    ops.iter().all(|(op, operand)| match op.as_str() {
        "_eq" => value == operand,
        "_neq" => value != operand,
        "_in" => operand
            .as_array()
            .map(|list| list.contains(value))
            .unwrap_or(false),
        "_nin" => operand
            .as_array()
            .map(|list| !list.contains(value))
            .unwrap_or(true),
        "_null" => value.is_null() == operand.as_bool().unwrap_or(true),
        "_nnull" => !value.is_null() == operand.as_bool().unwrap_or(true),
        "_gt" => compare(value, operand) == Some(Ordering::Greater),
        "_gte" => matches!(
            compare(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "_lt" => compare(value, operand) == Some(Ordering::Less),
        "_lte" => matches!(
            compare(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "_contains" => match (value.as_str(), operand.as_str()) {
            (Some(v), Some(o)) => v.contains(o),
            _ => value
                .as_array()
                .map(|list| list.contains(operand))
                .unwrap_or(false),
        },
        // Unknown operators never match rather than silently widening a read.
        _ => false,
    })
}

fn compare(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Keep only the selected top-level fields. `None` or `*` keeps everything.
pub fn project(record: &JsonValue, fields: Option<&[String]>) -> JsonValue {
    let (Some(fields), Some(obj)) = (fields, record.as_object()) else {
        return record.clone();
    };
    if fields.iter().any(|f| f == "*") {
        return record.clone();
    }
    let mut out = Map::new();
    for field in fields {
        let top = field.split('.').next().unwrap_or(field);
        if let Some(v) = obj.get(top) {
            out.insert(top.to_string(), v.clone());
        }
    }
    JsonValue::Object(out)
}
