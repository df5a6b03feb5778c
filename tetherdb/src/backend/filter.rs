// Filter matching for the in-memory backend: the subset of document-store
// query semantics the integrity layer and its callers rely on.

use crate::error::{Result, TetherError};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Check whether `doc` satisfies `filter`.
pub fn matches(doc: &Value, filter: &Value) -> Result<bool> {
    match filter {
        Value::Object(conditions) => matches_conditions(doc, conditions),
        Value::Null => Ok(true),
        other => Err(TetherError::Store(format!(
            "Filter must be an object, got {}",
            type_name(other)
        ))),
    }
}

fn matches_conditions(doc: &Value, conditions: &Map<String, Value>) -> Result<bool> {
    for (key, condition) in conditions {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in sub_queries(key, condition)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in sub_queries(key, condition)? {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for sub in sub_queries(key, condition)? {
                    if matches(doc, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(TetherError::Store(format!(
                    "Unsupported top-level operator '{op}'"
                )));
            }
            path => {
                let candidates = resolve_path(doc, path);
                matches_condition(&candidates, condition)?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_queries<'f>(op: &str, condition: &'f Value) -> Result<&'f Vec<Value>> {
    condition
        .as_array()
        .ok_or_else(|| TetherError::Store(format!("'{op}' expects an array of filters")))
}

/// Values found at a dotted path. Arrays met along the way fan out over their elements,
/// and numeric segments index into arrays.
pub fn resolve_path<'v>(doc: &'v Value, path: &str) -> Vec<&'v Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    resolve(doc, &segments, &mut out);
    out
}

fn resolve<'v>(value: &'v Value, segments: &[&str], out: &mut Vec<&'v Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                resolve(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    resolve(item, rest, out);
                }
            }
            for item in items.iter().filter(|item| item.is_object()) {
                resolve(item, segments, out);
            }
        }
        _ => {}
    }
}

/// Whether an object is made only of `$`-prefixed operator keys.
pub fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

/// Evaluate one field condition (literal or operator object) against the candidate values.
pub fn matches_condition(candidates: &[&Value], condition: &Value) -> Result<bool> {
    if !is_operator_object(condition) {
        return Ok(equals_any(candidates, condition));
    }
    let Value::Object(operators) = condition else {
        return Ok(false);
    };
    for (op, arg) in operators {
        if !apply_operator(candidates, op, arg, operators)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn apply_operator(
    candidates: &[&Value],
    op: &str,
    arg: &Value,
    siblings: &Map<String, Value>,
) -> Result<bool> {
    Ok(match op {
        "$eq" => equals_any(candidates, arg),
        "$ne" => !equals_any(candidates, arg),
        "$in" => {
            let list = operator_array(op, arg)?;
            list.iter().any(|item| equals_any(candidates, item))
        }
        "$nin" => {
            let list = operator_array(op, arg)?;
            !list.iter().any(|item| equals_any(candidates, item))
        }
        "$gt" => compares_any(candidates, arg, |o| o == Ordering::Greater),
        "$gte" => compares_any(candidates, arg, |o| o != Ordering::Less),
        "$lt" => compares_any(candidates, arg, |o| o == Ordering::Less),
        "$lte" => compares_any(candidates, arg, |o| o != Ordering::Greater),
        "$exists" => {
            let wanted = arg.as_bool().unwrap_or(true);
            !candidates.is_empty() == wanted
        }
        "$not" => {
            if arg.is_string() {
                !regex_any(candidates, arg, None)?
            } else {
                !matches_condition(candidates, arg)?
            }
        }
        "$size" => {
            let size = arg.as_u64().ok_or_else(|| {
                TetherError::Store("'$size' expects a non-negative integer".into())
            })? as usize;
            candidates
                .iter()
                .any(|c| c.as_array().map(|a| a.len() == size).unwrap_or(false))
        }
        "$all" => {
            let list = operator_array(op, arg)?;
            list.iter().all(|item| equals_any(candidates, item))
        }
        "$elemMatch" => {
            let mut found = false;
            for candidate in candidates {
                if let Some(items) = candidate.as_array() {
                    for item in items {
                        let ok = if is_operator_object(arg) {
                            matches_condition(&[item], arg)?
                        } else {
                            item.is_object() && matches(item, arg)?
                        };
                        if ok {
                            found = true;
                            break;
                        }
                    }
                }
                if found {
                    break;
                }
            }
            found
        }
        "$regex" => regex_any(candidates, arg, siblings.get("$options"))?,
        "$options" => true,
        other => {
            return Err(TetherError::Store(format!("Unsupported operator '{other}'")));
        }
    })
}

fn operator_array<'a>(op: &str, arg: &'a Value) -> Result<&'a Vec<Value>> {
    arg.as_array()
        .ok_or_else(|| TetherError::Store(format!("'{op}' expects an array")))
}

/// Candidates plus the elements of any array candidates, the way field conditions see them.
fn expanded<'v>(candidates: &[&'v Value]) -> Vec<&'v Value> {
    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        out.push(*candidate);
        if let Value::Array(items) = candidate {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(candidates: &[&Value], expected: &Value) -> bool {
    if candidates.is_empty() {
        return expected.is_null();
    }
    expanded(candidates)
        .iter()
        .any(|value| values_equal(value, expected))
}

fn compares_any(candidates: &[&Value], bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    expanded(candidates).iter().any(|value| {
        comparable(value, bound)
            .map(|ordering| accept(ordering))
            .unwrap_or(false)
    })
}

fn regex_any(candidates: &[&Value], pattern: &Value, options: Option<&Value>) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| TetherError::Store("'$regex' expects a string pattern".into()))?;
    let flags = options.and_then(|o| o.as_str()).unwrap_or("");
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .ignore_whitespace(flags.contains('x'))
        .build()
        .map_err(|e| TetherError::Store(format!("Invalid '$regex' pattern: {e}")))?;
    Ok(expanded(candidates)
        .iter()
        .filter_map(|v| v.as_str())
        .any(|s| regex.is_match(s)))
}

/// Structural equality where numbers compare by value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Ordering between two values of the same scalar kind
fn comparable(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total ordering used for sorting results: null < bool < number < string < array < object.
pub fn sort_order(a: &Value, b: &Value) -> Ordering {
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
    comparable(a, b).unwrap_or_else(|| rank(a).cmp(&rank(b)))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn book() -> Value {
        json!({
            "_id": "b1",
            "title": "Dune",
            "pages": 412,
            "author": "a1",
            "tags": ["scifi", "classic"],
            "slots": [{ "book": "x1", "row": 1 }, { "book": "x2", "row": 2 }],
            "editor": null
        })
    }

    #[test]
    fn test_equality_and_arrays() {
        let doc = book();
        assert!(matches(&doc, &json!({ "title": "Dune" })).unwrap());
        assert!(matches(&doc, &json!({ "tags": "scifi" })).unwrap());
        assert!(matches(&doc, &json!({ "tags": ["scifi", "classic"] })).unwrap());
        assert!(matches(&doc, &json!({ "slots.book": "x2" })).unwrap());
        assert!(matches(&doc, &json!({ "slots.0.row": 1 })).unwrap());
        assert!(matches(&doc, &json!({ "pages": 412.0 })).unwrap());
        assert!(!matches(&doc, &json!({ "title": "Emma" })).unwrap());
        assert!(matches(&doc, &json!({})).unwrap());
    }

    #[test]
    fn test_null_and_missing() {
        let doc = book();
        assert!(matches(&doc, &json!({ "editor": null })).unwrap());
        assert!(matches(&doc, &json!({ "missing": null })).unwrap());
        assert!(matches(&doc, &json!({ "editor": { "$exists": true } })).unwrap());
        assert!(!matches(&doc, &json!({ "missing": { "$exists": true } })).unwrap());
        assert!(matches(&doc, &json!({ "missing": { "$ne": "x" } })).unwrap());
    }

    #[test]
    fn test_operators() {
        let doc = book();
        assert!(matches(&doc, &json!({ "author": { "$in": ["a0", "a1"] } })).unwrap());
        assert!(matches(&doc, &json!({ "author": { "$nin": ["a0"] } })).unwrap());
        assert!(matches(&doc, &json!({ "tags": { "$in": ["classic"] } })).unwrap());
        assert!(matches(&doc, &json!({ "pages": { "$gt": 400, "$lte": 412 } })).unwrap());
        assert!(!matches(&doc, &json!({ "pages": { "$lt": 100 } })).unwrap());
        assert!(matches(&doc, &json!({ "tags": { "$size": 2 } })).unwrap());
        assert!(matches(&doc, &json!({ "tags": { "$all": ["classic", "scifi"] } })).unwrap());
        assert!(matches(&doc, &json!({ "title": { "$regex": "^du", "$options": "i" } })).unwrap());
        assert!(matches(&doc, &json!({ "title": { "$not": { "$eq": "Emma" } } })).unwrap());
        assert!(matches(
            &doc,
            &json!({ "slots": { "$elemMatch": { "book": "x1", "row": 1 } } })
        )
        .unwrap());
        assert!(!matches(
            &doc,
            &json!({ "slots": { "$elemMatch": { "book": "x1", "row": 2 } } })
        )
        .unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let doc = book();
        assert!(matches(&doc, &json!({ "$or": [{ "title": "Emma" }, { "pages": 412 }] })).unwrap());
        assert!(!matches(&doc, &json!({ "$and": [{ "title": "Dune" }, { "pages": 1 }] })).unwrap());
        assert!(matches(&doc, &json!({ "$nor": [{ "title": "Emma" }] })).unwrap());
    }

    #[test]
    fn test_unsupported_operators() {
        let doc = book();
        assert!(matches(&doc, &json!({ "$expr": { "$eq": [1, 1] } })).is_err());
        assert!(matches(&doc, &json!({ "pages": { "$mod": [2, 0] } })).is_err());
        assert!(matches(&doc, &json!({ "author": { "$in": "a1" } })).is_err());
    }

    #[test]
    fn test_sort_order() {
        assert_eq!(sort_order(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(sort_order(&Value::Null, &json!("a")), Ordering::Less);
        assert_eq!(sort_order(&json!("b"), &json!("a")), Ordering::Greater);
    }
}
