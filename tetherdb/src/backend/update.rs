// Update-operator engine for the in-memory backend.

use super::filter::{is_operator_object, matches, matches_condition, values_equal};
use crate::error::{Result, TetherError};
use serde_json::{Map, Value};

enum Leaf<'u> {
    Set(&'u Value),
    Unset,
    Inc(f64),
}

/// Apply an update document (`$set`, `$unset`, `$inc`, `$push`, `$pull`) in place.
/// `array_filters` resolve `$[ident]` positional segments. Returns whether anything changed.
pub fn apply_update(doc: &mut Value, update: &Value, array_filters: &[Value]) -> Result<bool> {
    let Value::Object(operators) = update else {
        return Err(TetherError::Store("Update must be an object".into()));
    };
    if operators.is_empty() || !operators.keys().all(|k| k.starts_with('$')) {
        return Err(TetherError::Store(
            "Update document must only contain update operators".into(),
        ));
    }

    let mut changed = false;
    for (op, fields) in operators {
        let Value::Object(fields) = fields else {
            return Err(TetherError::Store(format!("'{op}' expects an object")));
        };
        for (path, arg) in fields {
            let segments: Vec<&str> = path.split('.').collect();
            changed |= match op.as_str() {
                "$set" => apply_at(doc, &segments, array_filters, &Leaf::Set(arg))?,
                "$unset" => apply_at(doc, &segments, array_filters, &Leaf::Unset)?,
                "$inc" => {
                    let by = arg.as_f64().ok_or_else(|| {
                        TetherError::Store(format!("'$inc' on '{path}' expects a number"))
                    })?;
                    apply_at(doc, &segments, array_filters, &Leaf::Inc(by))?
                }
                "$push" => push_at(doc, path, arg)?,
                "$pull" => pull_at(doc, path, arg)?,
                other => {
                    return Err(TetherError::Store(format!(
                        "Unsupported update operator '{other}'"
                    )));
                }
            };
        }
    }
    Ok(changed)
}

fn apply_at(value: &mut Value, segments: &[&str], filters: &[Value], leaf: &Leaf) -> Result<bool> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(false);
    };

    if let Some(ident) = positional_ident(head) {
        let Value::Array(items) = value else {
            return Ok(false);
        };
        let mut changed = false;
        for item in items.iter_mut() {
            if !ident.is_empty() && !element_matches(item, ident, filters)? {
                continue;
            }
            changed |= if rest.is_empty() {
                replace_element(item, leaf)
            } else {
                apply_at(item, rest, filters, leaf)?
            };
        }
        return Ok(changed);
    }

    match value {
        Value::Object(map) => {
            if rest.is_empty() {
                return Ok(apply_leaf(map, head, leaf));
            }
            if !map.contains_key(*head) {
                if matches!(leaf, Leaf::Unset) {
                    return Ok(false);
                }
                map.insert(head.to_string(), Value::Object(Map::new()));
            }
            match map.get_mut(*head) {
                Some(next) => apply_at(next, rest, filters, leaf),
                None => Ok(false),
            }
        }
        Value::Array(items) => {
            let Ok(index) = head.parse::<usize>() else {
                return Err(TetherError::Store(format!(
                    "Cannot address field '{head}' inside an array without a positional operator"
                )));
            };
            match items.get_mut(index) {
                Some(item) if rest.is_empty() => Ok(replace_element(item, leaf)),
                Some(item) => apply_at(item, rest, filters, leaf),
                None => Ok(false),
            }
        }
        _ => Ok(false),
    }
}

fn positional_ident<'s>(segment: &'s str) -> Option<&'s str> {
    segment.strip_prefix("$[")?.strip_suffix(']')
}

/// An array element matches `$[ident]` when every array filter naming `ident` accepts it.
fn element_matches(item: &Value, ident: &str, filters: &[Value]) -> Result<bool> {
    let prefix = format!("{ident}.");
    let relevant: Vec<&Value> = filters
        .iter()
        .filter(|f| {
            f.as_object()
                .map(|m| m.keys().any(|k| k == ident || k.starts_with(&prefix)))
                .unwrap_or(false)
        })
        .collect();
    if relevant.is_empty() {
        return Err(TetherError::Store(format!(
            "No array filter found for identifier '{ident}'"
        )));
    }
    let mut wrapped = Map::new();
    wrapped.insert(ident.to_string(), item.clone());
    let wrapped = Value::Object(wrapped);
    for filter in relevant {
        if !matches(&wrapped, filter)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn apply_leaf(map: &mut Map<String, Value>, key: &str, leaf: &Leaf) -> bool {
    match leaf {
        Leaf::Set(value) => {
            let previous = map.insert(key.to_string(), (*value).clone());
            previous.as_ref() != Some(*value)
        }
        Leaf::Unset => map.remove(key).is_some(),
        Leaf::Inc(by) => {
            let current = map.get(key).and_then(Value::as_f64).unwrap_or(0.0);
            map.insert(key.to_string(), number(current + by));
            *by != 0.0
        }
    }
}

// Unsetting an array element leaves a null in its place
fn replace_element(item: &mut Value, leaf: &Leaf) -> bool {
    let next = match leaf {
        Leaf::Set(value) => (*value).clone(),
        Leaf::Unset => Value::Null,
        Leaf::Inc(by) => number(item.as_f64().unwrap_or(0.0) + by),
    };
    if *item == next {
        return false;
    }
    *item = next;
    true
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn field_mut<'v>(doc: &'v mut Value, path: &str, create: bool) -> Option<&'v mut Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => {
                if create && !map.contains_key(segment) {
                    map.insert(segment.to_string(), Value::Array(Vec::new()));
                }
                map.get_mut(segment)?
            }
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn push_at(doc: &mut Value, path: &str, arg: &Value) -> Result<bool> {
    let values: Vec<Value> = match arg.as_object().and_then(|m| m.get("$each")) {
        Some(Value::Array(each)) => each.clone(),
        Some(_) => return Err(TetherError::Store("'$each' expects an array".into())),
        None => vec![arg.clone()],
    };
    match field_mut(doc, path, true) {
        Some(Value::Array(items)) => {
            let changed = !values.is_empty();
            items.extend(values);
            Ok(changed)
        }
        Some(_) => Err(TetherError::Store(format!("'$push' target '{path}' is not an array"))),
        None => Ok(false),
    }
}

/// `$pull` removes elements matching a literal, an operator condition, or an element query.
fn pull_at(doc: &mut Value, path: &str, condition: &Value) -> Result<bool> {
    let Some(Value::Array(items)) = field_mut(doc, path, false) else {
        return Ok(false);
    };
    let before = items.len();
    let mut kept = Vec::with_capacity(before);
    for item in items.drain(..) {
        let pulled = if is_operator_object(condition) {
            matches_condition(&[&item], condition)?
        } else if condition.is_object() {
            item.is_object() && matches(&item, condition)?
        } else {
            values_equal(&item, condition)
        };
        if !pulled {
            kept.push(item);
        }
    }
    *items = kept;
    Ok(items.len() != before)
}
